use std::{
    env,
    fmt::Display,
    str::FromStr,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use tokio::sync::watch;

const DEFAULT_PORT: u16 = 3072;
const DEFAULT_TABLE: &str = "user_locations";
const DEFAULT_EXPIRY_SECS: u64 = 600;

#[derive(Clone)]
pub struct EnvVars {
    pub backend_url: String,
    pub api_key: String,
    pub access_token: Option<String>,
    pub participant_id: String,
    pub table: String,
    /// 0 disables expiry
    pub expiry_secs: u64,
    pub http_port: u16,
}

impl EnvVars {
    /// Expiry threshold in milliseconds, `None` when disabled
    pub fn expiry_ms(&self) -> Option<i64> {
        if self.expiry_secs == 0 {
            return None;
        }
        let ms = i64::try_from(self.expiry_secs)
            .ok()
            .and_then(|secs| secs.checked_mul(1000));
        if ms.is_none() {
            log::error!("Invalid LOCSHARE_EXPIRY_SECS `{}`: too large", self.expiry_secs);
            log::info!("Using default LOCSHARE_EXPIRY_SECS {DEFAULT_EXPIRY_SECS}");
        }
        Some(ms.unwrap_or(DEFAULT_EXPIRY_SECS as i64 * 1000))
    }
}

fn optional_var(name: &str) -> anyhow::Result<Option<String>> {
    match env::var(name) {
        Ok(v) if v.is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(e)) => {
            anyhow::bail!("Invalid value for environment variable {name}: {e:?}");
        }
    }
}

fn parse_or_default<T>(name: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|e| {
            log::error!("Invalid {name} `{value}`: {e}");
            log::info!("Using default {name} {default}");
            default
        }),
        Err(e) => {
            log::debug!("Error reading {name} from environment: {e}, using default {default}");
            default
        }
    }
}

pub fn load_env_vars() -> anyhow::Result<EnvVars> {
    let backend_url =
        env::var("LOCSHARE_BACKEND_URL").context("Please provide LOCSHARE_BACKEND_URL")?;
    let api_key = env::var("LOCSHARE_API_KEY").context("Please provide LOCSHARE_API_KEY")?;
    let participant_id = env::var("LOCSHARE_PARTICIPANT_ID")
        .context("Please provide LOCSHARE_PARTICIPANT_ID, the id of the signed in user")?;
    if participant_id.trim().is_empty() {
        anyhow::bail!("LOCSHARE_PARTICIPANT_ID must not be empty");
    }

    let access_token = optional_var("LOCSHARE_ACCESS_TOKEN")?;
    if access_token.is_none() {
        log::warn!("LOCSHARE_ACCESS_TOKEN is not set, using the anonymous api key");
    }
    let table = optional_var("LOCSHARE_TABLE")?.unwrap_or_else(|| DEFAULT_TABLE.to_string());

    Ok(EnvVars {
        backend_url,
        api_key,
        access_token,
        participant_id,
        table,
        expiry_secs: parse_or_default("LOCSHARE_EXPIRY_SECS", DEFAULT_EXPIRY_SECS),
        http_port: parse_or_default("HTTP_PORT", DEFAULT_PORT),
    })
}

#[macro_export]
macro_rules! set_config {
    ($config_param:expr, $value:expr) => {{
        match $config_param.lock().map(|mut lock| lock.set($value)) {
            Ok(v) => Ok(v),
            Err(e) => {
                log::error!(
                    "Error getting lock on mutex `{}`: {e}",
                    stringify!($config_param)
                );
                Err(e)
            }
        }
        .ok()
    }};
}

/// A value whose changes can be observed through `watch`
pub struct Field<T> {
    f: T,
    watcher: watch::Sender<T>,
}

impl<T> Field<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        let (watcher, _) = watch::channel(value.clone());
        Self { f: value, watcher }
    }

    pub fn get(&self) -> T {
        self.f.clone()
    }

    pub fn set(&mut self, value: T) {
        if self.f == value {
            return;
        }
        self.f = value;
        // send_replace does not fail when nobody is watching yet
        self.watcher.send_replace(self.f.clone());
    }

    pub fn watch(&self) -> watch::Receiver<T> {
        self.watcher.subscribe()
    }
}

#[derive(Clone)]
pub struct Config {
    pub sharing: Arc<Mutex<Field<bool>>>,
    pub share_at_startup: bool,
}

impl Config {
    pub fn new(share_at_startup: bool) -> Self {
        Self {
            sharing: Arc::new(Mutex::new(Field::new(false))),
            share_at_startup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_notifies_watchers_on_change_only() {
        let mut field = Field::new(false);
        let mut rx = field.watch();

        field.set(false);
        assert!(!rx.has_changed().unwrap());

        field.set(true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(field.get());
    }

    fn env_with_expiry(expiry_secs: u64) -> EnvVars {
        EnvVars {
            backend_url: "https://demo.example.co".into(),
            api_key: "anon".into(),
            access_token: None,
            participant_id: "me".into(),
            table: DEFAULT_TABLE.into(),
            expiry_secs,
            http_port: DEFAULT_PORT,
        }
    }

    #[test]
    fn expiry_in_milliseconds() {
        assert_eq!(env_with_expiry(0).expiry_ms(), None);
        assert_eq!(env_with_expiry(600).expiry_ms(), Some(600_000));
    }

    #[test]
    fn oversized_expiry_falls_back_to_default() {
        let default = Some(DEFAULT_EXPIRY_SECS as i64 * 1000);
        assert_eq!(env_with_expiry(u64::MAX).expiry_ms(), default);
        assert_eq!(env_with_expiry(i64::MAX as u64).expiry_ms(), default);
        assert_eq!(env_with_expiry(1 << 63).expiry_ms(), default);
    }

    #[test]
    fn set_config_updates_shared_field() {
        let config = Config::new(false);
        let mut rx = config.sharing.lock().unwrap().watch();
        assert_eq!(set_config!(config.sharing, true), Some(()));
        assert!(config.sharing.lock().unwrap().get());
        assert!(*rx.borrow_and_update());
    }
}
