//! Script-driven de-identification: a named script is an ordered list of
//! per-tag operations applied to every object of a study, followed by
//! optional honest-broker transforms, a conformance check of the script's
//! postconditions and a residual-PHI scan. Every change is captured in an
//! audit report.

pub mod audit;
pub mod dict;
pub mod engine;
pub mod ocr;
pub mod phi;
pub mod pixels;
pub mod script;

pub use audit::{AuditReport, FileAudit, TagChange};
pub use engine::{AnonymizeContext, Anonymizer, BrokerBinding};
pub use ocr::{merge_regions, OcrClient, OcrRegion};
pub use script::{Script, ScriptStore, TagAction, TagOp};
