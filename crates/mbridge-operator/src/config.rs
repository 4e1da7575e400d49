use mbridge_runtime::names;
use serde::{Deserialize, Serialize};

use crate::provider::ProviderRetention;

// ---------------------------------------------------------------------------
// ClassNames
// ---------------------------------------------------------------------------

/// Managed type names the loaders resolve.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassNames {
    /// Provider base type of the copying associative adapter.
    pub associative: String,
    /// Provider base type of the zero-copy associative adapter.
    pub associative_zero_copy: String,
    /// Provider base type of the non-associative adapter.
    pub non_associative: String,
    /// Result envelope carrying the `isArgumentReference` flag.
    pub return_type: String,
    /// Factory producing associative providers.
    pub associative_factory: String,
}

impl Default for ClassNames {
    fn default() -> Self {
        Self {
            associative: "mbridge/AssociativeMergeOperator".into(),
            associative_zero_copy: "mbridge/AssociativeZeroCopyMergeOperator".into(),
            non_associative: "mbridge/NonAssociativeMergeOperator".into(),
            return_type: "mbridge/ReturnType".into(),
            associative_factory: "mbridge/AssociativeMergeOperatorFactory".into(),
        }
    }
}

impl ClassNames {
    fn envelope(&self) -> String {
        format!("L{};", self.return_type)
    }

    /// `merge(key, existing, value, envelope)` over byte arrays.
    pub fn associative_merge_sig(&self) -> String {
        format!("([B[B[B{})[B", self.envelope())
    }

    /// `merge(key, existing, value, envelope)` over byte buffers.
    pub fn zero_copy_merge_sig(&self) -> String {
        let buffer = names::object_descriptor(names::BYTE_BUFFER);
        format!(
            "({buffer}{buffer}{buffer}{}){}",
            self.envelope(),
            names::object_descriptor(names::OBJECT)
        )
    }

    pub fn full_merge_sig(&self) -> String {
        format!("([B[B[[B{})[B", self.envelope())
    }

    pub fn partial_multi_merge_sig(&self) -> String {
        format!("([B[[B{})[B", self.envelope())
    }

    pub fn partial_merge_sig(&self) -> String {
        format!("([B[B[B{})[B", self.envelope())
    }

    pub fn should_merge_sig(&self) -> &'static str {
        "([[B)Z"
    }

    pub fn factory_name_sig(&self) -> String {
        format!("(){}", names::object_descriptor(names::STRING))
    }

    pub fn factory_create_sig(&self) -> String {
        format!("(Z){}", names::object_descriptor(&self.associative))
    }
}

// ---------------------------------------------------------------------------
// AdapterConfig
// ---------------------------------------------------------------------------

/// Which callback paths a non-associative adapter may reach.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NonAssociativeConfig {
    pub allow_single_operand: bool,
    pub allow_should_merge: bool,
    pub allow_partial_multi_merge: bool,
}

/// Adapter variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Associative,
    AssociativeZeroCopy,
    NonAssociative(NonAssociativeConfig),
    Xor,
}

/// Construction parameters of one adapter, fixed for its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub kind: AdapterKind,
    /// Overrides the bridge-wide provider retention for this adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<ProviderRetention>,
}

impl AdapterConfig {
    pub fn new(kind: AdapterKind) -> Self {
        Self { kind, retention: None }
    }

    pub fn associative() -> Self {
        Self::new(AdapterKind::Associative)
    }

    pub fn zero_copy() -> Self {
        Self::new(AdapterKind::AssociativeZeroCopy)
    }

    pub fn non_associative(flags: NonAssociativeConfig) -> Self {
        Self::new(AdapterKind::NonAssociative(flags))
    }

    pub fn xor() -> Self {
        Self::new(AdapterKind::Xor)
    }

    pub fn with_retention(mut self, retention: ProviderRetention) -> Self {
        self.retention = Some(retention);
        self
    }
}
