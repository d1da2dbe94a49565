use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// Connection-level password check. Every pgwire user shares one password;
/// consumer identity is established separately through `login`.
pub struct SharedPasswordAuthSource {
    password: String,
}

impl SharedPasswordAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

impl std::fmt::Debug for SharedPasswordAuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPasswordAuthSource")
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl AuthSource for SharedPasswordAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!(user = ?login.user(), "connection auth");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_password() {
        let source = SharedPasswordAuthSource::new("hunter2".into());
        let shown = format!("{source:?}");
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("redacted"));
    }
}
