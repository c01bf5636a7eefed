use crate::credential::app::InstallationTokenSource;
use crate::error::AppError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use std::sync::Arc;

/// 凭证的鉴权方式，负责把认证信息写进出站请求头。
#[derive(Clone)]
pub enum Authenticator {
    Token(String),
    /// OAuth 应用的 `client_id:client_secret`。
    Basic { client_id: String, client_secret: String },
    Installation(Arc<InstallationTokenSource>),
}

impl Authenticator {
    /// 覆盖（而不是追加）`Authorization`。
    pub async fn authenticate(&self, headers: &mut HeaderMap) -> Result<(), AppError> {
        let value = match self {
            Self::Token(token) => format!("Bearer {token}"),
            Self::Basic {
                client_id,
                client_secret,
            } => format!("Basic {}", STANDARD.encode(format!("{client_id}:{client_secret}"))),
            Self::Installation(source) => format!("Bearer {}", source.token().await?),
        };
        let mut value = HeaderValue::from_str(&value)
            .map_err(|_| AppError::config("凭证包含非法字符，无法写入 Authorization"))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
        Ok(())
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Token(***)"),
            Self::Basic { client_id, .. } => write!(f, "Basic({client_id})"),
            Self::Installation(source) => write!(f, "Installation({source:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replaces_client_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("token client-own"));
        Authenticator::Token("ghp_pool".to_string())
            .authenticate(&mut headers)
            .await
            .unwrap();
        assert_eq!(headers.get_all(AUTHORIZATION).iter().count(), 1);
        assert_eq!(headers[AUTHORIZATION], "Bearer ghp_pool");
    }

    #[tokio::test]
    async fn oauth_uses_basic_auth() {
        let mut headers = HeaderMap::new();
        Authenticator::Basic {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
        }
        .authenticate(&mut headers)
        .await
        .unwrap();
        // base64("id:secret")
        assert_eq!(headers[AUTHORIZATION], "Basic aWQ6c2VjcmV0");
    }
}
