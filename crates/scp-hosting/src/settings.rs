//! # settings：网关配置文件
//!
//! ## 契约说明（What）
//! - 配置以 TOML 书写，节与字段见 [`Settings`]；缺省字段取默认值；
//! - [`Settings::validate`] 在启动前检查：至少一个监听地址、至少一个上游、
//!   时长与容量均为正数、上游名字不重复；
//! - [`Settings::to_toml`] 输出补全默认值后的规范化配置，供 `scon -T` 打印。

use std::{collections::HashSet, fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 配置错误。
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("read configuration file {path} failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse configuration failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialize configuration failed: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub listen: ListenSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub upstream: Vec<UpstreamSettings>,
    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ListenSettings {
    /// TCP 监听地址。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,
    /// WebSocket 监听地址。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws: Option<String>,
    /// 同时进行中的握手上限，同时作为 WebSocket 待握手队列容量。
    pub accept_backlog: usize,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            tcp: None,
            ws: None,
            accept_backlog: 256,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSettings {
    pub handshake_timeout_ms: u64,
    /// 传输断开后等待换挂的最长时间，超时则关闭逻辑连接。
    pub reuse_timeout_ms: u64,
    pub send_buffer_capacity: usize,
    pub max_conns: u32,
    pub upstream_connect_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            reuse_timeout_ms: 30_000,
            send_buffer_capacity: 64 * 1024,
            max_conns: 65_536,
            upstream_connect_timeout_ms: 3_000,
        }
    }
}

impl SessionSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reuse_timeout(&self) -> Duration {
        Duration::from_millis(self.reuse_timeout_ms)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_connect_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UpstreamSettings {
    pub name: String,
    pub addr: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LogSettings {
    /// `EnvFilter` 语法的过滤指令，`RUST_LOG` 优先。
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

impl Settings {
    /// 读取并校验配置文件。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(raw: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |detail: &str| Err(SettingsError::Invalid(detail.to_owned()));
        if self.listen.tcp.is_none() && self.listen.ws.is_none() {
            return invalid("at least one of listen.tcp or listen.ws must be set");
        }
        if self.listen.accept_backlog == 0 {
            return invalid("listen.accept_backlog must be positive");
        }
        let session = &self.session;
        if session.handshake_timeout_ms == 0
            || session.reuse_timeout_ms == 0
            || session.upstream_connect_timeout_ms == 0
        {
            return invalid("session timeouts must be positive");
        }
        if session.send_buffer_capacity == 0 || session.max_conns == 0 {
            return invalid("session.send_buffer_capacity and session.max_conns must be positive");
        }
        if self.upstream.is_empty() {
            return invalid("at least one [[upstream]] is required");
        }
        let mut names = HashSet::new();
        for upstream in &self.upstream {
            if upstream.name.is_empty() || upstream.addr.is_empty() {
                return invalid("upstream name and addr must not be empty");
            }
            if upstream.weight == 0 {
                return Err(SettingsError::Invalid(format!(
                    "upstream `{}` has zero weight",
                    upstream.name
                )));
            }
            if !names.insert(upstream.name.as_str()) {
                return Err(SettingsError::Invalid(format!(
                    "duplicate upstream name `{}`",
                    upstream.name
                )));
            }
        }
        Ok(())
    }

    /// 规范化输出。
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
