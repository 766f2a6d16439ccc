// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Application and RabbitMQ settings. Values come from the process environment,
//! optionally seeded from a `.env` file.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::{env, fmt::Display, str::FromStr, time::Duration};
use tracing::debug;

pub const APP_NAME_ENV_KEY: &str = "APP_NAME";
pub const APP_ENV_ENV_KEY: &str = "APP_ENV";
pub const RABBITMQ_HOST_ENV_KEY: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT_ENV_KEY: &str = "RABBITMQ_PORT";
pub const RABBITMQ_USER_ENV_KEY: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASSWORD_ENV_KEY: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_VHOST_ENV_KEY: &str = "RABBITMQ_VHOST";
pub const RABBITMQ_PREFETCH_ENV_KEY: &str = "RABBITMQ_PREFETCH";
pub const RABBITMQ_RECONNECT_BASE_DELAY_ENV_KEY: &str = "RABBITMQ_RECONNECT_BASE_DELAY_MS";
pub const RABBITMQ_RECONNECT_MAX_DELAY_ENV_KEY: &str = "RABBITMQ_RECONNECT_MAX_DELAY_MS";

const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 2_000;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 600_000;

/// Deployment environment of the host process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Local,
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Development is the only environment where conflicting topology is
    /// deleted and recreated.
    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Environment::Local),
            "dev" | "develop" | "development" => Ok(Environment::Development),
            "stg" | "staging" => Ok(Environment::Staging),
            "prd" | "prod" | "production" => Ok(Environment::Production),
            _ => Err(ConfigError::InvalidValue {
                key: APP_ENV_ENV_KEY.to_owned(),
                value: s.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfigs {
    pub name: String,
    pub env: Environment,
}

impl Default for AppConfigs {
    fn default() -> Self {
        AppConfigs {
            name: "rabbitmq-retry".to_owned(),
            env: Environment::default(),
        }
    }
}

/// Connection settings for the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Default per-consumer prefetch
    pub prefetch: u16,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            prefetch: 1,
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
        }
    }
}

impl RabbitMQConfigs {
    /// AMQP URI built from the connection settings.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    /// First reconnect delay, doubled on every failed cycle.
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Upper bound of the reconnect delay.
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
}

impl Configs {
    /// Loads the configuration from the environment.
    ///
    /// A `.env` file in the working directory is read first when present;
    /// variables already set in the process take precedence. Missing
    /// variables keep their defaults, malformed numbers are rejected.
    pub fn from_env() -> Result<Configs, ConfigError> {
        if dotenvy::dotenv().is_ok() {
            debug!(".env file loaded");
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Configs, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Configs::default();

        if let Some(name) = lookup(APP_NAME_ENV_KEY) {
            cfg.app.name = name;
        }
        if let Some(env) = lookup(APP_ENV_ENV_KEY) {
            cfg.app.env = env.parse()?;
        }
        if let Some(host) = lookup(RABBITMQ_HOST_ENV_KEY) {
            cfg.rabbitmq.host = host;
        }
        if let Some(user) = lookup(RABBITMQ_USER_ENV_KEY) {
            cfg.rabbitmq.user = user;
        }
        if let Some(password) = lookup(RABBITMQ_PASSWORD_ENV_KEY) {
            cfg.rabbitmq.password = password;
        }
        if let Some(vhost) = lookup(RABBITMQ_VHOST_ENV_KEY) {
            cfg.rabbitmq.vhost = vhost;
        }

        cfg.rabbitmq.port = parse_or(&lookup, RABBITMQ_PORT_ENV_KEY, cfg.rabbitmq.port)?;
        cfg.rabbitmq.prefetch =
            parse_or(&lookup, RABBITMQ_PREFETCH_ENV_KEY, cfg.rabbitmq.prefetch)?;
        cfg.rabbitmq.reconnect_base_delay_ms = parse_or(
            &lookup,
            RABBITMQ_RECONNECT_BASE_DELAY_ENV_KEY,
            cfg.rabbitmq.reconnect_base_delay_ms,
        )?;
        cfg.rabbitmq.reconnect_max_delay_ms = parse_or(
            &lookup,
            RABBITMQ_RECONNECT_MAX_DELAY_ENV_KEY,
            cfg.rabbitmq.reconnect_max_delay_ms,
        )?;

        Ok(cfg)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
            key: key.to_owned(),
            value: raw,
        }),
        None => Ok(default),
    }
}
