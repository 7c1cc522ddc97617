use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const IN_TOTO_STATEMENT_TYPE: &str = "https://in-toto.io/Statement/v0.1";
pub const SLSA_PREDICATE_TYPE: &str = "https://slsa.dev/provenance/v0.2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlsaLevel {
    Slsa1,
    Slsa2,
    Slsa3,
    Slsa4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,
    pub digest: DigestSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestSet {
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Builder {
    pub id: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub uri: String,
    pub digest: DigestSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub config_source: ConfigSource,
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub capability: String,
    pub route_id: String,
    pub tool: String,
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceMetadata {
    pub build_invocation_id: String,
    pub build_started_on: i64,
    pub build_finished_on: i64,
    pub completeness_parameters: bool,
    pub completeness_environment: bool,
    pub completeness_materials: bool,
    pub reproducible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Material {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<DigestSet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlsaProvenancePredicate {
    pub builder: Builder,
    pub build_type: String,
    pub invocation: Invocation,
    pub build_config: BuildConfig,
    pub metadata: ProvenanceMetadata,
    pub materials: Vec<Material>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InTotoStatement {
    #[serde(rename = "_type")]
    pub statement_type: String,
    pub predicate_type: String,
    pub subject: Vec<Subject>,
    pub predicate: SlsaProvenancePredicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub keyid: String,
    pub sig: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// base64-encoded canonical JSON of the statement
    pub payload: String,
    pub payload_type: String,
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attestation {
    pub id: String,
    pub step_id: String,
    pub ticket_id: String,
    pub statement: InTotoStatement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
    pub created_at: i64,
}
