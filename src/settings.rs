//! Client configuration and pre-flight validation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::credentials::CdKeyDecoder;
use crate::error::Result;
use crate::product::Product;

/// Default gateway port.
pub const DEFAULT_PORT: u16 = 6112;

/// Default ping method name.
pub const DEFAULT_PING_METHOD: &str = "normal";

/// Configuration for one [`BncsClient`](crate::BncsClient).
///
/// Missing fields take their defaults when loading from JSON, so a settings
/// file only has to name what it changes. Nothing is checked until
/// [`validate`] runs.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub username: String,
    pub password: String,
    /// Four-character product code, e.g. `"SEXP"`.
    pub product: String,
    /// The product's current version byte.
    pub version_byte: u32,
    pub cd_key: String,
    /// Second key, for products that need one.
    pub expansion_cd_key: String,
    /// Name reported as the key owner in `SID_AUTH_CHECK`.
    pub cd_key_owner: String,
    pub gateway: Gateway,
    /// One of `"normal"`, `"zero_latency"` or `"no_reply"`.
    ///
    /// Stored as text so that an unrecognized value survives loading and is
    /// reported by [`validate`].
    pub ping_method: String,
    /// The game executable and the two support libraries hashed by the
    /// revision check.
    pub game_exe: PathBuf,
    pub game_file2: PathBuf,
    pub game_file3: PathBuf,
    /// Lockdown image, for products whose revision check needs one.
    pub lockdown_image: Option<PathBuf>,
    /// Channel joined automatically after entering chat. Empty for none.
    pub home_channel: String,
    /// Address offered when the server asks for one.
    pub email: String,
    pub locale: LocaleInfo,
    /// Log in as soon as the client check passes.
    ///
    /// Defaults to **true**.
    pub auto_login: bool,
    /// Remove a subscriber after this many faults in one bucket.
    ///
    /// Defaults to **None** (never remove).
    pub handler_fault_limit: Option<u32>,
}

impl ClientSettings {
    /// Create settings for `username` logging on to `host` with `product`,
    /// leaving everything else at its default.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        product: Product,
        host: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            product: product.code().to_string(),
            gateway: Gateway::new(host),
            ..Self::default()
        }
    }

    /// Load settings from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::Config`](crate::BncsError::Config) if the document
    /// does not parse.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The configured ping method, if it is recognized.
    pub fn ping_method(&self) -> Option<PingMethod> {
        self.ping_method.parse().ok()
    }

    /// The configured product, if it is recognized.
    pub fn product(&self) -> Option<Product> {
        Product::from_code(&self.product)
    }

    #[must_use]
    pub fn with_version_byte(mut self, version_byte: u32) -> Self {
        self.version_byte = version_byte;
        self
    }

    #[must_use]
    pub fn with_cd_key(mut self, key: impl Into<String>) -> Self {
        self.cd_key = key.into();
        self
    }

    #[must_use]
    pub fn with_expansion_cd_key(mut self, key: impl Into<String>) -> Self {
        self.expansion_cd_key = key.into();
        self
    }

    #[must_use]
    pub fn with_cd_key_owner(mut self, owner: impl Into<String>) -> Self {
        self.cd_key_owner = owner.into();
        self
    }

    /// Defaults to **6112**.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.gateway.port = port;
        self
    }

    /// Defaults to [`PingMethod::Normal`].
    #[must_use]
    pub fn with_ping_method(mut self, method: PingMethod) -> Self {
        self.ping_method = method.as_str().to_string();
        self
    }

    /// Set the three files hashed by the revision check.
    #[must_use]
    pub fn with_game_files(
        mut self,
        exe: impl Into<PathBuf>,
        file2: impl Into<PathBuf>,
        file3: impl Into<PathBuf>,
    ) -> Self {
        self.game_exe = exe.into();
        self.game_file2 = file2.into();
        self.game_file3 = file3.into();
        self
    }

    #[must_use]
    pub fn with_lockdown_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.lockdown_image = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_home_channel(mut self, channel: impl Into<String>) -> Self {
        self.home_channel = channel.into();
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }

    #[must_use]
    pub fn with_locale(mut self, locale: LocaleInfo) -> Self {
        self.locale = locale;
        self
    }

    #[must_use]
    pub fn with_auto_login(mut self, auto_login: bool) -> Self {
        self.auto_login = auto_login;
        self
    }

    #[must_use]
    pub fn with_handler_fault_limit(mut self, limit: u32) -> Self {
        self.handler_fault_limit = Some(limit);
        self
    }

    /// Trim free-text fields and strip separators from the CD keys.
    fn normalize(&mut self) {
        for field in [
            &mut self.username,
            &mut self.cd_key_owner,
            &mut self.home_channel,
            &mut self.email,
            &mut self.product,
        ] {
            let trimmed = field.trim();
            if trimmed.len() != field.len() {
                *field = trimmed.to_string();
            }
        }
        self.gateway.host = self.gateway.host.trim().to_string();
        for key in [&mut self.cd_key, &mut self.expansion_cd_key] {
            *key = key
                .chars()
                .filter(|c| !c.is_whitespace() && *c != '-')
                .map(|c| c.to_ascii_uppercase())
                .collect();
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            product: String::new(),
            version_byte: 0,
            cd_key: String::new(),
            expansion_cd_key: String::new(),
            cd_key_owner: String::new(),
            gateway: Gateway::default(),
            ping_method: DEFAULT_PING_METHOD.to_string(),
            game_exe: PathBuf::new(),
            game_file2: PathBuf::new(),
            game_file3: PathBuf::new(),
            lockdown_image: None,
            home_channel: String::new(),
            email: String::new(),
            locale: LocaleInfo::default(),
            auto_login: true,
            handler_fault_limit: None,
        }
    }
}

impl fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSettings")
            .field("username", &self.username)
            .field("product", &self.product)
            .field("version_byte", &self.version_byte)
            .field("gateway", &self.gateway)
            .field("ping_method", &self.ping_method)
            .field("game_exe", &self.game_exe)
            .field("home_channel", &self.home_channel)
            .field("auto_login", &self.auto_login)
            .field("handler_fault_limit", &self.handler_fault_limit)
            .finish_non_exhaustive()
    }
}

/// Server address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Gateway {
    pub host: String,
    pub port: u16,
}

impl Gateway {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Locale fields reported in `SID_AUTH_INFO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocaleInfo {
    /// Four-character language code, e.g. `"enUS"`.
    pub product_language: String,
    pub locale_id: u32,
    pub language_id: u32,
    pub country_abbreviation: String,
    pub country: String,
    /// Minutes to add to local time to get UTC. Defaults to 0 (UTC); hosts
    /// outside UTC set their own offset.
    pub timezone_bias: i32,
}

impl Default for LocaleInfo {
    fn default() -> Self {
        Self {
            product_language: "enUS".to_string(),
            locale_id: 1033,
            language_id: 1033,
            country_abbreviation: "USA".to_string(),
            country: "United States".to_string(),
            timezone_bias: 0,
        }
    }
}

/// How the client answers server pings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PingMethod {
    /// Echo every server ping.
    #[default]
    Normal,
    /// Send a zero ping up front and ignore server pings.
    ZeroLatency,
    /// Never answer.
    NoReply,
}

impl PingMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::ZeroLatency => "zero_latency",
            Self::NoReply => "no_reply",
        }
    }
}

impl fmt::Display for PingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PingMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "zero_latency" => Ok(Self::ZeroLatency),
            "no_reply" => Ok(Self::NoReply),
            other => Err(format!("unknown ping method {other:?}")),
        }
    }
}

bitflags! {
    /// Every rule a [`ClientSettings`] value broke.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ValidationErrors: u32 {
        const GAME_EXE_MISSING = 1 << 0;
        const GAME_FILE2_MISSING = 1 << 1;
        const GAME_FILE3_MISSING = 1 << 2;
        const USERNAME_EMPTY = 1 << 3;
        const INVALID_PING_METHOD = 1 << 4;
        const GATEWAY_EMPTY = 1 << 5;
        const UNKNOWN_PRODUCT = 1 << 6;
        const PRODUCT_NOT_CONNECTABLE = 1 << 7;
        const CD_KEY_MISSING = 1 << 8;
        const CD_KEY_INVALID = 1 << 9;
        const EXPANSION_KEY_MISSING = 1 << 10;
        const EXPANSION_KEY_INVALID = 1 << 11;
        const LOCKDOWN_IMAGE_MISSING = 1 << 12;
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("no errors");
        }
        for (i, (name, _)) in self.iter_names().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(name)?;
        }
        Ok(())
    }
}

/// Check `settings` against every rule and return all violations at once.
///
/// Free-text fields are trimmed and CD keys lose their separators as a side
/// effect, so the settings the session later reads are the normalized ones.
pub fn validate(settings: &mut ClientSettings, keys: &dyn CdKeyDecoder) -> ValidationErrors {
    let mut errors = ValidationErrors::empty();

    for (path, flag) in [
        (&settings.game_exe, ValidationErrors::GAME_EXE_MISSING),
        (&settings.game_file2, ValidationErrors::GAME_FILE2_MISSING),
        (&settings.game_file3, ValidationErrors::GAME_FILE3_MISSING),
    ] {
        if !file_exists(path) {
            errors |= flag;
        }
    }

    settings.normalize();

    if settings.username.is_empty() {
        errors |= ValidationErrors::USERNAME_EMPTY;
    }
    if settings.ping_method().is_none() {
        errors |= ValidationErrors::INVALID_PING_METHOD;
    }
    if settings.gateway.host.is_empty() {
        errors |= ValidationErrors::GATEWAY_EMPTY;
    }

    match settings.product() {
        None => errors |= ValidationErrors::UNKNOWN_PRODUCT,
        Some(product) => {
            let caps = product.capabilities();
            if !caps.connectable {
                errors |= ValidationErrors::PRODUCT_NOT_CONNECTABLE;
            }
            if caps.cd_keys_required >= 1 {
                errors |= check_key(
                    &settings.cd_key,
                    keys,
                    ValidationErrors::CD_KEY_MISSING,
                    ValidationErrors::CD_KEY_INVALID,
                );
            }
            if caps.cd_keys_required >= 2 {
                errors |= check_key(
                    &settings.expansion_cd_key,
                    keys,
                    ValidationErrors::EXPANSION_KEY_MISSING,
                    ValidationErrors::EXPANSION_KEY_INVALID,
                );
            }
            if caps.requires_lockdown
                && !settings.lockdown_image.as_deref().is_some_and(file_exists)
            {
                errors |= ValidationErrors::LOCKDOWN_IMAGE_MISSING;
            }
        }
    }

    if !errors.is_empty() {
        warn!(%errors, username = %settings.username, "settings failed validation");
    }
    errors
}

fn file_exists(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.exists()
}

fn check_key(
    key: &str,
    keys: &dyn CdKeyDecoder,
    missing: ValidationErrors,
    invalid: ValidationErrors,
) -> ValidationErrors {
    if key.is_empty() {
        missing
    } else if !keys.is_structurally_valid(key) {
        invalid
    } else {
        ValidationErrors::empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::credentials::KeyBlock;

    /// Accepts any all-alphanumeric key of a known length.
    struct LengthDecoder;

    impl CdKeyDecoder for LengthDecoder {
        fn is_structurally_valid(&self, key: &str) -> bool {
            matches!(key.len(), 13 | 16 | 26) && key.chars().all(|c| c.is_ascii_alphanumeric())
        }

        fn key_block(&self, _: &str, _: u32, _: u32) -> Option<KeyBlock> {
            None
        }
    }

    fn temp_file(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("bncs-{tag}-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"stub").unwrap();
        path
    }

    fn valid_settings() -> ClientSettings {
        ClientSettings::new("Arthas", "secret", Product::Diablo2, "uswest.example.net")
            .with_cd_key("AAAABBBBCCCCDDDD")
            .with_game_files(temp_file("exe"), temp_file("f2"), temp_file("f3"))
    }

    #[test]
    fn valid_settings_pass() {
        let mut settings = valid_settings();
        assert_eq!(validate(&mut settings, &LengthDecoder), ValidationErrors::empty());
    }

    #[test]
    fn every_violation_is_reported() {
        let mut settings = valid_settings();
        settings.game_exe = PathBuf::from("/nonexistent/game.exe");
        settings.username = "   ".into();
        settings.ping_method = "sometimes".into();
        let errors = validate(&mut settings, &LengthDecoder);
        assert_eq!(
            errors,
            ValidationErrors::GAME_EXE_MISSING
                | ValidationErrors::USERNAME_EMPTY
                | ValidationErrors::INVALID_PING_METHOD
        );
        let text = errors.to_string();
        assert!(text.contains("GAME_EXE_MISSING"));
        assert!(text.contains("USERNAME_EMPTY"));
        assert!(text.contains("INVALID_PING_METHOD"));
    }

    #[test]
    fn expansion_key_checked_only_for_two_key_products() {
        let mut settings = valid_settings();
        assert!(validate(&mut settings, &LengthDecoder).is_empty());

        settings.product = "D2XP".into();
        assert_eq!(
            validate(&mut settings, &LengthDecoder),
            ValidationErrors::EXPANSION_KEY_MISSING
        );

        settings.expansion_cd_key = "short".into();
        assert_eq!(
            validate(&mut settings, &LengthDecoder),
            ValidationErrors::EXPANSION_KEY_INVALID
        );
    }

    #[test]
    fn lockdown_image_required_for_lockdown_products() {
        let mut settings = valid_settings();
        settings.product = "STAR".into();
        settings.cd_key = "1234567890123".into();
        assert_eq!(
            validate(&mut settings, &LengthDecoder),
            ValidationErrors::LOCKDOWN_IMAGE_MISSING
        );
        settings.lockdown_image = Some(temp_file("lockdown"));
        assert!(validate(&mut settings, &LengthDecoder).is_empty());
    }

    #[test]
    fn unknown_and_unsupported_products() {
        let mut settings = valid_settings();
        settings.product = "ZZZZ".into();
        assert_eq!(
            validate(&mut settings, &LengthDecoder),
            ValidationErrors::UNKNOWN_PRODUCT
        );
        settings.product = "DRTL".into();
        assert_eq!(
            validate(&mut settings, &LengthDecoder),
            ValidationErrors::PRODUCT_NOT_CONNECTABLE
        );
    }

    #[test]
    fn normalization_trims_and_strips_key_separators() {
        let mut settings = valid_settings()
            .with_cd_key("aaaa-bbbb-cccc-dddd")
            .with_home_channel("  Clan Recruit ");
        assert!(validate(&mut settings, &LengthDecoder).is_empty());
        assert_eq!(settings.cd_key, "AAAABBBBCCCCDDDD");
        assert_eq!(settings.home_channel, "Clan Recruit");
    }

    #[test]
    fn json_uses_defaults_for_missing_fields() {
        let settings = ClientSettings::from_json(
            r#"{ "username": "Thrall", "product": "WAR3", "gateway": { "host": "europe.example.net" } }"#,
        )
        .unwrap();
        assert_eq!(settings.gateway.port, DEFAULT_PORT);
        assert_eq!(settings.ping_method(), Some(PingMethod::Normal));
        assert_eq!(settings.locale.country, "United States");
        assert!(settings.auto_login);
        assert_eq!(settings.handler_fault_limit, None);
        assert!(settings.email.is_empty());
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = ClientSettings::from_json("{ not json").unwrap_err();
        assert!(matches!(err, crate::BncsError::Config(_)));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let settings = valid_settings();
        let text = format!("{settings:?}");
        assert!(!text.contains("secret"));
        assert!(!text.contains("AAAABBBB"));
    }
}
