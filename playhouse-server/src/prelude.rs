pub use crate::api_dispatcher::{ApiController, ApiHandler, HandlerRegistry};
pub use crate::api_server::ApiServerBuilder;
pub use crate::cli::Cli;
pub use crate::config::{ApiServerOptions, PlayServerOptions};
pub use crate::errors::{PlayServerError, Result};
pub use crate::play_server::PlayServerBuilder;
pub use crate::router::StageRegistration;
