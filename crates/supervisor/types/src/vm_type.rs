use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The execution-environment family a node belongs to.
///
/// Part of the `(network, subnet, vmType)` grouping triple that keys a
/// [`PipelineId`](crate::PipelineId); two nodes with the same triple (case-insensitively)
/// share a pipeline. Serializes as the plain lowercase string (`"evm"`, `"movevm"`, ...),
/// matching `VmType`'s own [`Display`](fmt::Display) impl, so it round-trips through the
/// config bucket's JSON without a wrapper object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VmType {
    /// Ethereum Virtual Machine and its forks (Ethereum, Polygon, BSC, Avalanche C-Chain, ...).
    Evm,
    /// UTXO-model chains (Bitcoin, Litecoin, Dogecoin, ...).
    Utxo,
    /// Solana Virtual Machine.
    Svm,
    /// WebAssembly-based runtimes (Polkadot, Cosmos, ...).
    Wasm,
    /// Move VM (Aptos, Sui).
    Move,
    /// Cairo VM (StarkNet).
    Cairo,
    /// Any VM family not covered by a dedicated variant, carried verbatim.
    Custom(String),
}

impl Serialize for VmType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for VmType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or_else(|e: core::convert::Infallible| match e {}))
    }
}

impl VmType {
    /// Lowercased canonical name, as used in subject names and [`PipelineId`](crate::PipelineId).
    pub fn as_str(&self) -> &str {
        match self {
            Self::Evm => "evm",
            Self::Utxo => "utxo",
            Self::Svm => "svm",
            Self::Wasm => "wasm",
            Self::Move => "move",
            Self::Cairo => "cairo",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmType {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "evm" => Self::Evm,
            "utxo" => Self::Utxo,
            "svm" => Self::Svm,
            "wasm" => Self::Wasm,
            "move" => Self::Move,
            "cairo" => Self::Cairo,
            other => Self::Custom(other.to_owned()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_variants() {
        for (input, expected) in [
            ("evm", VmType::Evm),
            ("EVM", VmType::Evm),
            ("Utxo", VmType::Utxo),
            ("svm", VmType::Svm),
        ] {
            assert_eq!(input.parse::<VmType>().unwrap(), expected);
        }
    }

    #[test]
    fn unknown_variant_is_preserved_lowercase() {
        assert_eq!("MoveVm".parse::<VmType>().unwrap(), VmType::Custom("movevm".into()));
    }

    #[test]
    fn serializes_to_lowercase_string() {
        assert_eq!(serde_json::to_string(&VmType::Evm).unwrap(), "\"evm\"");
        assert_eq!(serde_json::to_string(&VmType::Custom("movevm".into())).unwrap(), "\"movevm\"");
    }
}
