use serde::{Deserialize, Deserializer, Serialize};

/// Last-known profile of the logged-in user.
///
/// Stored in the durable session record so a restarted client can show who
/// is logged in before `api/users/me` has been revalidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserProfile {
    /// The login response calls this `user_id`, `api/users/me` calls it `id`,
    /// and the backend has sent both numbers and strings.
    #[serde(alias = "id", deserialize_with = "string_or_number")]
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "avatarURL")]
    pub avatar_url: Option<String>,
}

impl UserProfile {
    /// Name to show in the shell: full name when known, username otherwise
    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.username)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}
