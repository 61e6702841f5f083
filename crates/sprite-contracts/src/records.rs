use serde::{Deserialize, Serialize};

/// Reply body of a successful sprite creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSprite {
    pub url: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpriteEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SpriteList {
    #[serde(default)]
    pub sprites: Vec<SpriteEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub success: bool,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn sprite_entry_tolerates_missing_created_at() -> anyhow::Result<()> {
        let parsed: SpriteList = serde_json::from_value(json!({
            "sprites": [{ "name": "a.png", "url": "https://cdn/a.png" }]
        }))?;
        assert_eq!(parsed.sprites.len(), 1);
        assert_eq!(parsed.sprites[0].created_at, None);
        Ok(())
    }

    #[test]
    fn created_sprite_uses_client_field_names() -> anyhow::Result<()> {
        let value = serde_json::to_value(CreatedSprite {
            url: "https://cdn/x.png".to_string(),
            filename: "x.png".to_string(),
        })?;
        assert_eq!(value["url"], Value::String("https://cdn/x.png".to_string()));
        assert_eq!(value["filename"], Value::String("x.png".to_string()));
        Ok(())
    }
}
