//! Runtime configuration and the host alias table.
//!
//! The config file is line oriented: `key value` pairs separated by
//! whitespace, with `#` starting a comment when it is the first
//! non-whitespace character of a line. Numeric values are decimal integers
//! interpreted as seconds. [`Conf::load`] resets everything to defaults
//! before applying the file, so reloading is idempotent.

use std::collections::HashMap;
use std::io::Result as IoResult;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;

/// The alias sentinel naming the fallback canonical host.
const FALLBACK: &str = "(fallback)";

#[derive(Debug, Clone)]
struct Items {
    key_path: PathBuf,
    cert_path: PathBuf,
    /// bcrypt hash of the shared connection password. Empty until
    /// configured, which rejects every cell logon.
    conn_key: String,

    port_hlhv: u16,
    port_https: u16,

    garden_freq: u64,
    max_band_age: u64,

    timeout: u64,
    timeout_read_header: u64,
    timeout_read: u64,
    timeout_write: u64,
    timeout_idle: u64,
}

impl Default for Items {
    fn default() -> Self {
        Self {
            key_path: PathBuf::from("/var/hlhv/cert/key.pem"),
            cert_path: PathBuf::from("/var/hlhv/cert/cert.pem"),
            conn_key: String::new(),

            port_hlhv: 2001,
            port_https: 443,

            garden_freq: 120,
            max_band_age: 60,

            timeout: 1,
            timeout_read_header: 5,
            timeout_read: 10,
            timeout_write: 15,
            timeout_idle: 120,
        }
    }
}

#[derive(Debug, Clone)]
struct Aliases {
    fallback: Option<String>,
    database: HashMap<String, String>,
}

impl Default for Aliases {
    fn default() -> Self {
        let database = [
            ("localhost", "@"),
            ("127.0.0.1", "@"),
            ("::ffff:127.0.0.1", "@"),
            ("::1", "@"),
        ]
        .into_iter()
        .map(|(left, right)| (left.to_owned(), right.to_owned()))
        .collect();
        Self {
            fallback: None,
            database,
        }
    }
}

/// Shared configuration. Mutated only by [`Conf::load`], which takes the
/// write locks; every other accessor takes a read lock.
#[derive(Debug, Default)]
pub struct Conf {
    items: RwLock<Items>,
    aliases: RwLock<Aliases>,
}

impl Conf {
    /// Configuration with built-in defaults and no connection key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and apply a config file.
    pub fn load(&self, path: &Path) -> IoResult<()> {
        tracing::info!(path = %path.display(), "reading config file");
        let text = std::fs::read_to_string(path)?;
        self.load_str(&text);

        let aliases = self.aliases.read();
        if let Some(fallback) = &aliases.fallback {
            tracing::debug!("using alias (fallback) -> {fallback}");
        }
        for (left, right) in &aliases.database {
            tracing::debug!("using alias {left} -> {right}");
        }
        Ok(())
    }

    /// Reset to defaults, then apply `key value` lines.
    pub(crate) fn load_str(&self, text: &str) {
        let mut items = self.items.write();
        let mut aliases = self.aliases.write();
        *items = Items::default();
        *aliases = Aliases::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            handle_key_val(&mut items, &mut aliases, key, val.trim());
        }
    }

    /// Check a presented connection password against the stored bcrypt
    /// hash.
    #[must_use]
    pub fn check_conn_key(&self, against: &str) -> bool {
        let hash = self.items.read().conn_key.clone();
        bcrypt::verify(against, &hash).unwrap_or(false)
    }

    /// Rewrite a literal hostname to its canonical form. Hosts without an
    /// alias entry resolve to the fallback when one is configured, or pass
    /// through unchanged.
    #[must_use]
    pub fn resolve_aliases(&self, input: &str) -> String {
        let aliases = self.aliases.read();
        if let Some(canonical) = aliases.database.get(input) {
            return canonical.clone();
        }
        if let Some(fallback) = &aliases.fallback {
            return fallback.clone();
        }
        input.to_owned()
    }

    pub fn key_path(&self) -> PathBuf {
        self.items.read().key_path.clone()
    }

    pub fn cert_path(&self) -> PathBuf {
        self.items.read().cert_path.clone()
    }

    pub fn port_hlhv(&self) -> u16 {
        self.items.read().port_hlhv
    }

    pub fn port_https(&self) -> u16 {
        self.items.read().port_https
    }

    pub fn garden_freq(&self) -> Duration {
        Duration::from_secs(self.items.read().garden_freq)
    }

    pub fn max_band_age(&self) -> Duration {
        Duration::from_secs(self.items.read().max_band_age)
    }

    /// Logon-phase socket deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.items.read().timeout)
    }

    pub fn timeout_read_header(&self) -> Duration {
        Duration::from_secs(self.items.read().timeout_read_header)
    }

    pub fn timeout_read(&self) -> Duration {
        Duration::from_secs(self.items.read().timeout_read)
    }

    pub fn timeout_write(&self) -> Duration {
        Duration::from_secs(self.items.read().timeout_write)
    }

    pub fn timeout_idle(&self) -> Duration {
        Duration::from_secs(self.items.read().timeout_idle)
    }
}

fn handle_key_val(items: &mut Items, aliases: &mut Aliases, key: &str, val: &str) {
    let valn = || val.parse::<u64>().unwrap_or(0);
    let port = || val.parse::<u16>().unwrap_or(0);

    match key {
        "alias" => {
            let Some((left, right)) = val.split_once("->") else {
                return;
            };
            let left = left.trim();
            let right = right.trim();
            if left.is_empty() || right.is_empty() {
                return;
            }
            if left == FALLBACK {
                aliases.fallback = Some(right.to_owned());
            } else {
                aliases.database.insert(left.to_owned(), right.to_owned());
            }
        }
        "unalias" => {
            aliases.database.remove(val);
        }

        "keyPath" => items.key_path = PathBuf::from(val),
        "certPath" => items.cert_path = PathBuf::from(val),
        "connKey" => items.conn_key = val.to_owned(),
        "portHlhv" => items.port_hlhv = port(),
        "portHttps" => items.port_https = port(),
        "gardenFreq" => items.garden_freq = valn(),
        "maxBandAge" => items.max_band_age = valn(),
        "timeout" => items.timeout = valn(),
        "timeoutReadHeader" => items.timeout_read_header = valn(),
        "timeoutRead" => items.timeout_read = valn(),
        "timeoutWrite" => items.timeout_write = valn(),
        "timeoutIdle" => items.timeout_idle = valn(),
        other => tracing::warn!("unrecognised config key {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let conf = Conf::new();
        assert_eq!(conf.port_hlhv(), 2001);
        assert_eq!(conf.port_https(), 443);
        assert_eq!(conf.garden_freq(), Duration::from_secs(120));
        assert_eq!(conf.max_band_age(), Duration::from_secs(60));
        assert_eq!(conf.timeout(), Duration::from_secs(1));
        assert_eq!(conf.resolve_aliases("localhost"), "@");
        assert_eq!(conf.resolve_aliases("::1"), "@");
    }

    #[test]
    fn parses_keys_and_comments() {
        let conf = Conf::new();
        conf.load_str(
            "# leading comment\n\
             portHlhv 2002\n\
             \t portHttps   8443\n\
             maxBandAge 5\n\
             keyPath /tmp/key.pem # not a comment, part of the value\n\
             danglingKeyWithoutValue\n",
        );
        assert_eq!(conf.port_hlhv(), 2002);
        assert_eq!(conf.port_https(), 8443);
        assert_eq!(conf.max_band_age(), Duration::from_secs(5));
        // '#' only opens a comment at the start of a line
        assert_eq!(
            conf.key_path(),
            PathBuf::from("/tmp/key.pem # not a comment, part of the value")
        );
    }

    #[test]
    fn alias_and_fallback() {
        let conf = Conf::new();
        conf.load_str(
            "alias www.example.com -> example.com\n\
             alias (fallback) -> example.com\n",
        );
        assert_eq!(conf.resolve_aliases("www.example.com"), "example.com");
        // no entry, fallback configured
        assert_eq!(conf.resolve_aliases("other.example.net"), "example.com");
    }

    #[test]
    fn unalias_removes_builtin() {
        let conf = Conf::new();
        conf.load_str("unalias localhost\n");
        assert_eq!(conf.resolve_aliases("localhost"), "localhost");
        // the rest of the built-ins survive
        assert_eq!(conf.resolve_aliases("127.0.0.1"), "@");
    }

    #[test]
    fn alias_resolution_is_idempotent_without_fallback() {
        let conf = Conf::new();
        conf.load_str("alias left -> right\n");
        let once = conf.resolve_aliases("left");
        assert_eq!(once, "right");
        assert_eq!(conf.resolve_aliases(&once), "right");
    }

    #[test]
    fn reload_resets_to_defaults() {
        let conf = Conf::new();
        conf.load_str("portHlhv 9000\n");
        assert_eq!(conf.port_hlhv(), 9000);
        conf.load_str("");
        assert_eq!(conf.port_hlhv(), 2001);
    }

    #[test]
    fn conn_key_uses_bcrypt() {
        let conf = Conf::new();
        let hash = bcrypt::hash("port manteau", 4).expect("hash");
        conf.load_str(&format!("connKey {hash}\n"));
        assert!(conf.check_conn_key("port manteau"));
        assert!(!conf.check_conn_key("wrong"));
    }

    #[test]
    fn empty_conn_key_rejects_everything() {
        let conf = Conf::new();
        assert!(!conf.check_conn_key(""));
        assert!(!conf.check_conn_key("anything"));
    }
}
