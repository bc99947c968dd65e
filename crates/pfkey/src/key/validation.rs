//! Validation.
//!
//! Two kinds of checks live here: the [`Validatable`] trait used by
//! configuration types, and the maturity checks an SA must pass before it
//! leaves the Larval state.
//!
//! # Example
//!
//! ```
//! use pfkey::key::config::KeyConfig;
//! use pfkey::key::validation::Validatable;
//!
//! let config = KeyConfig::new().spi_range(0x2000, 0x1000);
//! let result = config.validate();
//! assert!(!result.is_valid());
//! assert_eq!(result.errors[0].field, "spi_range");
//! ```

use super::algorithm::{AlgorithmKind, AlgorithmTable, aalg, calg, ealg};
use super::error::{Error, Result, ValidationErrorInfo};
use super::ext::{KeyMaterial, sa_flags};
use super::message::IpsecProtocol;
use super::sa::SecurityAssociation;

/// One finding about a configuration field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Findings of a [`Validatable::validate`] run. Errors make the value
/// unusable; warnings are only logged.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    /// `Error::Validation` listing every error, or `Ok` when there are none.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(Error::Validation(
            self.errors
                .into_iter()
                .map(|e| ValidationErrorInfo::new(e.field, e.message))
                .collect(),
        ))
    }
}

/// Values checked before the engine accepts them.
pub trait Validatable {
    fn validate(&self) -> ValidationResult;

    fn is_valid(&self) -> bool {
        self.validate().is_valid()
    }
}

// ============================================================================
// SA maturity
// ============================================================================

fn reject(msg: impl Into<String>) -> Error {
    Error::AlgorithmRejected(msg.into())
}

fn check_key(
    algorithms: &dyn AlgorithmTable,
    kind: AlgorithmKind,
    id: u8,
    key: Option<&KeyMaterial>,
    what: &str,
) -> Result<()> {
    let info = algorithms
        .lookup(kind, id)
        .ok_or_else(|| reject(format!("unknown {what} algorithm {id}")))?;
    let bits = key.map_or(0, |k| k.bits);
    if bits < info.min_bits || bits > info.max_bits {
        return Err(reject(format!(
            "{what} key of {bits} bits outside {}..={} for {}",
            info.min_bits, info.max_bits, info.name
        )));
    }
    if let Some(key) = key {
        algorithms.validate(kind, id, &key.data)?;
    }
    Ok(())
}

/// Check whether a Larval SA may become Mature.
pub fn check_maturity(sa: &SecurityAssociation, algorithms: &dyn AlgorithmTable) -> Result<()> {
    match sa.protocol {
        IpsecProtocol::Ah | IpsecProtocol::Esp if sa.spi <= 0xff => {
            return Err(reject(format!("SPI {} is reserved", sa.spi)));
        }
        _ => {}
    }

    match sa.protocol {
        IpsecProtocol::Esp => {
            if sa.flags & sa_flags::OLD != 0 && sa.flags & sa_flags::DERIV != 0 {
                return Err(reject("old and derived-IV flags are exclusive"));
            }
            if sa.auth_alg != aalg::NONE {
                check_key(algorithms, AlgorithmKind::Auth, sa.auth_alg, sa.key_auth.as_ref(), "auth")?;
            }
            check_key(algorithms, AlgorithmKind::Encrypt, sa.enc_alg, sa.key_enc.as_ref(), "encryption")?;
        }
        IpsecProtocol::Ah => {
            if sa.flags & sa_flags::DERIV != 0 {
                return Err(reject("derived IV is meaningless for AH"));
            }
            if sa.enc_alg != ealg::NONE {
                return Err(reject("AH cannot carry an encryption algorithm"));
            }
            check_key(algorithms, AlgorithmKind::Auth, sa.auth_alg, sa.key_auth.as_ref(), "auth")?;
        }
        IpsecProtocol::IpComp => {
            if sa.auth_alg != aalg::NONE {
                return Err(reject("IPComp cannot carry an auth algorithm"));
            }
            if sa.flags & sa_flags::RAWCPI == 0 && sa.spi >= 0x10000 {
                return Err(reject(format!("CPI {:#x} does not fit 16 bits", sa.spi)));
            }
            if sa.enc_alg == calg::NONE || algorithms.lookup(AlgorithmKind::Compress, sa.enc_alg).is_none() {
                return Err(reject(format!("unknown compression algorithm {}", sa.enc_alg)));
            }
        }
    }
    Ok(())
}

/// Check which key extensions a protocol may carry.
pub fn check_key_placement(
    protocol: IpsecProtocol,
    key_auth: Option<&KeyMaterial>,
    key_enc: Option<&KeyMaterial>,
) -> Result<()> {
    if key_auth.is_some() && protocol == IpsecProtocol::IpComp {
        return Err(Error::malformed("IPComp SA with an auth key"));
    }
    if key_enc.is_some() && protocol != IpsecProtocol::Esp {
        return Err(Error::malformed(format!("{protocol} SA with an encryption key")));
    }
    Ok(())
}
