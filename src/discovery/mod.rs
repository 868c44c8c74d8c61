//! Dynamic discovery of app-provided tools.
//!
//! [`Scanner`] finds providers and fetches their schemas, [`Translator`]
//! turns each discovered app into namespaced tools, and
//! [`IntegrationRegistrar`] keeps the registry in step with what is
//! installed.

pub mod registrar;
pub mod remote;
pub mod scanner;
pub mod schema;
pub mod translator;

pub use registrar::{IntegrationRegistrar, RescanOutcome, RescanSummary};
pub use remote::{AppEndpoint, VerifyPolicy};
pub use scanner::{ProviderTrust, Scanner};
pub use schema::{parse_schema, AppSchema, DiscoveredApp, ToolDefinition};
pub use translator::{derive_prefix, TranslateError, Translator};
