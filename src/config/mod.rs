use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration, built once at startup and passed by reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backup: BackupConfig,
    pub node: NodeConfig,
    pub database: DatabaseConfig,
    pub archive: ArchiveConfig,
    pub remote: RemoteConfig,
    pub telegram: TelegramConfig,
    pub metrics: MetricsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub dir: PathBuf,
    pub interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub name: String,
    pub user: String,
    pub password: String,
    #[serde(rename = "dumpBin")]
    pub dump_bin: String,
    pub socket: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub app: String,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub targets: Vec<String>,
    pub user: String,
    /// Defaults to the local backup directory.
    pub dir: Option<PathBuf>,
    #[serde(rename = "sshPort")]
    pub ssh_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub token: String,
    #[serde(rename = "chatId")]
    pub chat_id: String,
    /// Bot API server, for self-hosted deployments. Telegram's own if unset.
    #[serde(rename = "apiUrl")]
    pub api_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    #[serde(rename = "pushgatewayUrl")]
    pub pushgateway_url: Option<String>,
    /// Also push a `conf_backup` series for the config archive.
    #[serde(rename = "reportConfig")]
    pub report_config: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Fixed offset used for the "Local" half of log lines; host zone if unset.
    #[serde(rename = "localOffsetHours")]
    pub local_offset_hours: Option<i32>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/backups/db"),
            interval: "1h".to_string(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "localhost".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "virtualizor".to_string(),
            user: "root".to_string(),
            password: String::new(),
            dump_bin: "mysqldump".to_string(),
            socket: None,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            app: "virtualizor".to_string(),
            paths: vec![
                PathBuf::from("/var/virtualizor/log"),
                PathBuf::from("/usr/local/virtualizor/universal.php"),
                PathBuf::from("/usr/local/virtualizor/conf"),
            ],
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            user: "root".to_string(),
            dir: None,
            ssh_port: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            local_offset_hours: Some(7),
        }
    }
}

impl Config {
    /// Standard config file locations (checked in order)
    fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("vzbackup.toml"),
            PathBuf::from("/etc/vzbackup/vzbackup.toml"),
        ];
        if let Some(home) = dirs::home_dir() {
            paths.insert(1, home.join(".config/vzbackup/vzbackup.toml"));
        }
        paths
    }

    /// Load config from `explicit` or the first standard location, then apply
    /// environment overrides and validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::config_paths().into_iter().find(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Config::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config from {}", path.display()))
    }

    /// Overlay the environment-style keys the agent has always honoured.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DB_BACKUP_DIR") {
            self.backup.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BACKUP_INTERVAL") {
            self.backup.interval = v;
        }
        if let Some(v) = lookup("RSYNC_TARGETS") {
            self.remote.targets = parse_targets(&v);
        }
        if let Some(v) = lookup("RSYNC_USER") {
            self.remote.user = v;
        }
        if let Some(v) = lookup("RSYNC_REMOTE_DIR") {
            self.remote.dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SSH_PORT") {
            self.remote.ssh_port = parse_optional(&v).context("invalid SSH_PORT")?;
        }
        if let Some(v) = lookup("NODE_IP") {
            self.node.id = v;
        }
        if let Some(v) = lookup("DB_USER") {
            self.database.user = v;
        }
        if let Some(v) = lookup("DB_PASS") {
            self.database.password = v;
        }
        if let Some(v) = lookup("DB_NAME") {
            self.database.name = v;
        }
        if let Some(v) = lookup("MYSQLDUMP_BIN") {
            self.database.dump_bin = v;
        }
        if let Some(v) = lookup("MYSQL_SOCKET") {
            self.database.socket = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("APP_NAME") {
            self.archive.app = v;
        }
        if let Some(v) = lookup("TELEGRAM_BOT_TOKEN") {
            self.telegram.token = v;
        }
        if let Some(v) = lookup("TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = v;
        }
        if let Some(v) = lookup("TELEGRAM_API_URL") {
            self.telegram.api_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("PUSHGATEWAY_URL") {
            self.metrics.pushgateway_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("LOG_LOCAL_OFFSET") {
            self.log.local_offset_hours =
                parse_optional(&v).context("invalid LOG_LOCAL_OFFSET")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        crate::job::parse_duration(&self.backup.interval)
            .with_context(|| format!("invalid backup interval '{}'", self.backup.interval))?;
        check_name("database name", &self.database.name)?;
        check_name("app name", &self.archive.app)?;
        if self.database.dump_bin.trim().is_empty() {
            anyhow::bail!("dump binary must not be empty");
        }
        if let Some(hours) = self.log.local_offset_hours {
            if !(-12..=14).contains(&hours) {
                anyhow::bail!("local offset {} is out of range (-12..=14)", hours);
            }
        }
        if let Some(url) = &self.telegram.api_url {
            reqwest::Url::parse(url)
                .with_context(|| format!("invalid Telegram API url '{}'", url))?;
        }
        Ok(())
    }

    /// Directory used on every remote target.
    pub fn remote_dir(&self) -> &Path {
        self.remote.dir.as_deref().unwrap_or(&self.backup.dir)
    }

    /// Copy with credentials masked, for printing.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.database.password.is_empty() {
            copy.database.password = "***".to_string();
        }
        if !copy.telegram.token.is_empty() {
            copy.telegram.token = "***".to_string();
        }
        copy
    }
}

fn parse_targets(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Empty means unset; anything else must parse.
fn parse_optional<T>(raw: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    Ok(Some(raw.parse::<T>().with_context(|| format!("'{}'", raw))?))
}

/// Names end up in filenames and unquoted remote globs, so only plain
/// filename characters are allowed.
fn check_name(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        anyhow::bail!("{} must not be empty", what);
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        anyhow::bail!("{} '{}' contains invalid character {:?}", what, value, bad);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_legacy_deployment() {
        let cfg = Config::default();
        assert_eq!(cfg.backup.dir, PathBuf::from("/var/backups/db"));
        assert_eq!(cfg.database.name, "virtualizor");
        assert_eq!(cfg.node.id, "localhost");
        assert!(cfg.remote.targets.is_empty());
        assert_eq!(cfg.remote_dir(), Path::new("/var/backups/db"));
        cfg.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[
            ("DB_BACKUP_DIR", "/srv/backups"),
            ("RSYNC_TARGETS", "host1, ,host2,"),
            ("NODE_IP", "10.0.0.5"),
            ("DB_NAME", "panel"),
            ("MYSQL_SOCKET", ""),
            ("PUSHGATEWAY_URL", "http://pg:9091"),
            ("SSH_PORT", " 2222 "),
            ("LOG_LOCAL_OFFSET", ""),
        ]))
        .unwrap();

        assert_eq!(cfg.backup.dir, PathBuf::from("/srv/backups"));
        assert_eq!(cfg.remote.targets, vec!["host1", "host2"]);
        assert_eq!(cfg.node.id, "10.0.0.5");
        assert_eq!(cfg.database.name, "panel");
        assert_eq!(cfg.database.socket, None);
        assert_eq!(cfg.metrics.pushgateway_url.as_deref(), Some("http://pg:9091"));
        assert_eq!(cfg.remote_dir(), Path::new("/srv/backups"));
        assert_eq!(cfg.remote.ssh_port, Some(2222));
        assert_eq!(cfg.log.local_offset_hours, None);
    }

    #[test]
    fn test_toml_partial_file() {
        let cfg: Config = toml::from_str(
            r#"
            [backup]
            interval = "30m"

            [remote]
            targets = ["backup1"]
            sshPort = 2222

            [metrics]
            reportConfig = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.backup.interval, "30m");
        assert_eq!(cfg.backup.dir, PathBuf::from("/var/backups/db"));
        assert_eq!(cfg.remote.ssh_port, Some(2222));
        assert_eq!(cfg.remote.user, "root");
        assert!(cfg.metrics.report_config);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.backup.interval = "hourly".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.database.name = "../etc".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.log.local_offset_hours = Some(30);
        assert!(cfg.validate().is_err());

        for name in ["my db", "app*", "x?y", "[a]", "a'b", "a;rm"] {
            let mut cfg = Config::default();
            cfg.database.name = name.to_string();
            assert!(cfg.validate().is_err(), "{} should be rejected", name);
        }
        let mut cfg = Config::default();
        cfg.archive.app = "virtualizor-2.conf_x".to_string();
        cfg.validate().unwrap();

        let mut cfg = Config::default();
        cfg.telegram.api_url = Some("not a url".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_env_rejects_unparsable_numbers() {
        let mut cfg = Config::default();
        let err = cfg.apply_env(env(&[("SSH_PORT", "22O")])).unwrap_err();
        assert!(format!("{:#}", err).contains("SSH_PORT"));

        let mut cfg = Config::default();
        let err = cfg.apply_env(env(&[("LOG_LOCAL_OFFSET", "+7h")])).unwrap_err();
        assert!(format!("{:#}", err).contains("LOG_LOCAL_OFFSET"));

        let mut cfg = Config::default();
        assert!(cfg.apply_env(env(&[("SSH_PORT", "70000")])).is_err());
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let mut cfg = Config::default();
        cfg.database.password = "hunter2".to_string();
        cfg.telegram.token = "123:abc".to_string();
        let red = cfg.redacted();
        assert_eq!(red.database.password, "***");
        assert_eq!(red.telegram.token, "***");
        assert_eq!(cfg.database.password, "hunter2");
    }
}
