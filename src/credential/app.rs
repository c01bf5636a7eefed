//! GitHub App 安装令牌：用 App 私钥签 JWT，再换取短期 installation token。

use crate::error::AppError;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Url;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// 提前刷新的余量。
const REFRESH_MARGIN: Duration = Duration::minutes(5);
/// GitHub 要求 JWT 有效期不超过 10 分钟；iat 回拨 60 秒抵消时钟偏差。
const JWT_BACKDATE: Duration = Duration::seconds(60);
const JWT_TTL: Duration = Duration::minutes(9);

#[derive(Debug, Serialize, Deserialize)]
struct AppClaims {
    iss: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - REFRESH_MARGIN
    }
}

pub struct InstallationTokenSource {
    app_id: String,
    installation_id: String,
    key: EncodingKey,
    token_url: Url,
    http: reqwest::Client,
    cached: ArcSwapOption<CachedToken>,
}

impl std::fmt::Debug for InstallationTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationTokenSource")
            .field("app_id", &self.app_id)
            .field("installation_id", &self.installation_id)
            .finish_non_exhaustive()
    }
}

impl InstallationTokenSource {
    pub fn new(
        app_id: &str,
        installation_id: &str,
        private_key: &str,
        api_url: &Url,
        http: reqwest::Client,
    ) -> Result<Self, AppError> {
        let key = load_key(private_key)?;
        let token_url = api_url
            .join(&format!("app/installations/{installation_id}/access_tokens"))
            .map_err(|e| AppError::config(format!("安装令牌地址无效: {e}")))?;

        Ok(Self {
            app_id: app_id.to_string(),
            installation_id: installation_id.to_string(),
            key,
            token_url,
            http,
            cached: ArcSwapOption::empty(),
        })
    }

    /// 返回可用的安装令牌；缓存未过期时不发请求。
    ///
    /// 并发刷新时可能重复换取，后写入的覆盖先写入的，两个令牌都有效。
    pub async fn token(&self) -> Result<String, AppError> {
        let now = Utc::now();
        if let Some(cached) = self.cached.load_full()
            && cached.is_fresh(now)
        {
            return Ok(cached.token.clone());
        }

        let fresh = self.exchange(now).await?;
        let token = fresh.token.clone();
        self.cached.store(Some(Arc::new(fresh)));
        Ok(token)
    }

    fn app_jwt(&self, now: DateTime<Utc>) -> Result<String, AppError> {
        let claims = AppClaims {
            iss: self.app_id.clone(),
            iat: (now - JWT_BACKDATE).timestamp(),
            exp: (now + JWT_TTL).timestamp(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| AppError::upstream(format!("签发 App JWT 失败: {e}")))
    }

    async fn exchange(&self, now: DateTime<Utc>) -> Result<CachedToken, AppError> {
        let jwt = self.app_jwt(now)?;
        let resp = self
            .http
            .post(self.token_url.clone())
            .header(AUTHORIZATION, format!("Bearer {jwt}"))
            .header(ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| AppError::upstream(format!("换取安装令牌失败: {e}")))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| AppError::upstream(format!("读取安装令牌响应失败: {e}")))?;
        if body.len() > (1 << 20) {
            return Err(AppError::upstream("安装令牌响应过大"));
        }

        if !status.is_success() {
            warn!(
                "换取安装令牌失败（app {} / installation {}，HTTP {}）：{}",
                self.app_id,
                self.installation_id,
                status.as_u16(),
                String::from_utf8_lossy(&body)
            );
            return Err(AppError::upstream(format!(
                "换取安装令牌失败: HTTP {}",
                status.as_u16()
            )));
        }

        let parsed = sonic_rs::from_slice::<AccessTokenResponse>(&body)
            .map_err(|e| AppError::upstream(format!("安装令牌响应无法解析: {e}")))?;
        info!(
            "已刷新安装令牌：{}:{}，过期时间 {}",
            self.app_id, self.installation_id, parsed.expires_at
        );
        Ok(CachedToken {
            token: parsed.token,
            expires_at: parsed.expires_at,
        })
    }
}

/// 私钥可直接给 PEM 内容，否则按文件路径读取。
fn load_key(private_key: &str) -> Result<EncodingKey, AppError> {
    let pem = if private_key.trim_start().starts_with("-----BEGIN") {
        private_key.to_string()
    } else {
        std::fs::read_to_string(private_key)
            .map_err(|e| AppError::config(format!("读取 App 私钥失败 {private_key}: {e}")))?
    };
    EncodingKey::from_rsa_pem(pem.as_bytes())
        .map_err(|e| AppError::config(format!("App 私钥无效: {e}")))
}
