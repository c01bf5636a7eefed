//! 凭证：启动时由配置解析，进程生命周期内不可变。

pub mod app;
pub mod auth;
pub mod types;

use crate::config::Config;
use crate::error::AppError;
use app::InstallationTokenSource;
use auth::Authenticator;
use reqwest::Url;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use types::CredentialSpec;

pub use types::hash_token;

#[derive(Debug, Clone)]
pub struct Credential {
    pub identity: String,
    pub auth: Authenticator,
}

impl Credential {
    pub fn from_spec(
        spec: CredentialSpec,
        api_url: &Url,
        http: &reqwest::Client,
    ) -> Result<Self, AppError> {
        let identity = spec.identity();
        let auth = match spec {
            CredentialSpec::Token { token, .. } => Authenticator::Token(token),
            CredentialSpec::OAuth {
                client_id,
                client_secret,
            } => Authenticator::Basic {
                client_id,
                client_secret,
            },
            CredentialSpec::App {
                app_id,
                installation_id,
                private_key,
            } => Authenticator::Installation(Arc::new(InstallationTokenSource::new(
                &app_id,
                &installation_id,
                &private_key,
                api_url,
                http.clone(),
            )?)),
        };
        Ok(Self { identity, auth })
    }
}

/// 按 OAuth、App、个人令牌的顺序构建全部凭证。
pub fn load_all(cfg: &Config, http: &reqwest::Client) -> Result<Vec<Credential>, AppError> {
    let mut specs = Vec::new();
    for raw in &cfg.auth_oauth {
        specs.push(CredentialSpec::parse_oauth(raw)?);
    }
    for raw in &cfg.auth_app {
        specs.push(CredentialSpec::parse_app(raw)?);
    }
    for raw in &cfg.auth_token {
        specs.push(CredentialSpec::parse_token(raw)?);
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        let cred = Credential::from_spec(spec, &cfg.api_url, http)?;
        if !seen.insert(cred.identity.clone()) {
            // 同名标识会共用一组配额记录与指标标签。
            warn!("凭证标识重复：{}", cred.identity);
        }
        out.push(cred);
    }

    info!("已加载 {} 个凭证", out.len());
    Ok(out)
}
