//! Products the server recognizes and what each one requires.
//!
//! Every product-conditional decision (credential scheme, number of CD keys,
//! lockdown image) reads [`Product::capabilities`].

use std::fmt;
use std::str::FromStr;

/// How a product proves the account password.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialFamily {
    /// Token-seeded password hash (`SID_LOGONRESPONSE2` / `SID_CREATEACCOUNT2`).
    LegacyHash,
    /// Zero-knowledge exchange (`SID_AUTH_ACCOUNTLOGON` and friends).
    ZeroKnowledge,
}

/// Product requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductCapabilities {
    pub credential_family: CredentialFamily,
    /// How many CD keys `SID_AUTH_CHECK` must carry (0, 1 or 2).
    pub cd_keys_required: u8,
    /// Whether the revision check needs a lockdown image.
    pub requires_lockdown: bool,
    /// Whether this client can log on with the product.
    pub connectable: bool,
}

/// A recognized product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Product {
    Starcraft,
    BroodWar,
    Warcraft2,
    Diablo2,
    LordOfDestruction,
    Warcraft3,
    FrozenThrone,
    Diablo,
    DiabloShareware,
    StarcraftShareware,
    StarcraftJapan,
}

const LEGACY_ONE_KEY_LOCKDOWN: ProductCapabilities = ProductCapabilities {
    credential_family: CredentialFamily::LegacyHash,
    cd_keys_required: 1,
    requires_lockdown: true,
    connectable: true,
};

const UNSUPPORTED: ProductCapabilities = ProductCapabilities {
    credential_family: CredentialFamily::LegacyHash,
    cd_keys_required: 0,
    requires_lockdown: false,
    connectable: false,
};

impl Product {
    /// Every product, in table order.
    pub const ALL: [Product; 11] = [
        Self::Starcraft,
        Self::BroodWar,
        Self::Warcraft2,
        Self::Diablo2,
        Self::LordOfDestruction,
        Self::Warcraft3,
        Self::FrozenThrone,
        Self::Diablo,
        Self::DiabloShareware,
        Self::StarcraftShareware,
        Self::StarcraftJapan,
    ];

    /// The four-character product code.
    pub fn code(self) -> &'static str {
        match self {
            Self::Starcraft => "STAR",
            Self::BroodWar => "SEXP",
            Self::Warcraft2 => "W2BN",
            Self::Diablo2 => "D2DV",
            Self::LordOfDestruction => "D2XP",
            Self::Warcraft3 => "WAR3",
            Self::FrozenThrone => "W3XP",
            Self::Diablo => "DRTL",
            Self::DiabloShareware => "DSHR",
            Self::StarcraftShareware => "SSHR",
            Self::StarcraftJapan => "JSTR",
        }
    }

    /// Look a product up by code, ignoring ASCII case.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.code().eq_ignore_ascii_case(code.trim()))
    }

    pub fn capabilities(self) -> ProductCapabilities {
        match self {
            Self::Starcraft | Self::BroodWar | Self::Warcraft2 => LEGACY_ONE_KEY_LOCKDOWN,
            Self::Diablo2 => ProductCapabilities {
                credential_family: CredentialFamily::LegacyHash,
                cd_keys_required: 1,
                requires_lockdown: false,
                connectable: true,
            },
            Self::LordOfDestruction => ProductCapabilities {
                credential_family: CredentialFamily::LegacyHash,
                cd_keys_required: 2,
                requires_lockdown: false,
                connectable: true,
            },
            Self::Warcraft3 => ProductCapabilities {
                credential_family: CredentialFamily::ZeroKnowledge,
                cd_keys_required: 1,
                requires_lockdown: false,
                connectable: true,
            },
            Self::FrozenThrone => ProductCapabilities {
                credential_family: CredentialFamily::ZeroKnowledge,
                cd_keys_required: 2,
                requires_lockdown: false,
                connectable: true,
            },
            Self::Diablo | Self::DiabloShareware | Self::StarcraftShareware | Self::StarcraftJapan => {
                UNSUPPORTED
            }
        }
    }

    /// The code as the little-endian dword the wire carries (`"STAR"` is
    /// sent as the bytes `RATS`).
    pub fn dword(self) -> u32 {
        code_dword(self.code())
    }
}

/// Pack a four-character code into its wire dword.
pub(crate) fn code_dword(code: &str) -> u32 {
    let mut value = 0u32;
    for byte in code.bytes().take(4) {
        value = (value << 8) | u32::from(byte);
    }
    value
}

/// Unpack a wire dword into its four-character code.
pub(crate) fn dword_code(value: u32) -> String {
    value
        .to_be_bytes()
        .iter()
        .filter(|b| **b != 0)
        .map(|b| char::from(*b))
        .collect()
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Error returned when parsing an unknown product code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProduct(pub String);

impl fmt::Display for UnknownProduct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown product code {:?}", self.0)
    }
}

impl std::error::Error for UnknownProduct {}

impl FromStr for Product {
    type Err = UnknownProduct;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_code(s).ok_or_else(|| UnknownProduct(s.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for product in Product::ALL {
            assert_eq!(Product::from_code(product.code()), Some(product));
        }
        assert_eq!("w3xp".parse::<Product>().unwrap(), Product::FrozenThrone);
        assert!("XXXX".parse::<Product>().is_err());
    }

    #[test]
    fn expansion_products_need_two_keys() {
        assert_eq!(Product::LordOfDestruction.capabilities().cd_keys_required, 2);
        assert_eq!(Product::FrozenThrone.capabilities().cd_keys_required, 2);
        assert_eq!(Product::Diablo2.capabilities().cd_keys_required, 1);
    }

    #[test]
    fn warcraft3_family_uses_zero_knowledge() {
        assert_eq!(
            Product::Warcraft3.capabilities().credential_family,
            CredentialFamily::ZeroKnowledge
        );
        assert_eq!(
            Product::BroodWar.capabilities().credential_family,
            CredentialFamily::LegacyHash
        );
    }

    #[test]
    fn only_starcraft_and_warcraft2_need_lockdown() {
        let lockdown: Vec<_> = Product::ALL
            .into_iter()
            .filter(|p| p.capabilities().requires_lockdown)
            .collect();
        assert_eq!(
            lockdown,
            vec![Product::Starcraft, Product::BroodWar, Product::Warcraft2]
        );
    }

    #[test]
    fn dword_packs_big_end_first() {
        assert_eq!(Product::Starcraft.dword(), 0x5354_4152);
        assert_eq!(Product::Starcraft.dword().to_le_bytes(), *b"RATS");
        assert_eq!(dword_code(0x5354_4152), "STAR");
    }
}
