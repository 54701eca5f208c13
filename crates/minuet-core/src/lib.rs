// src/lib.rs
pub mod config;
pub mod error;
pub mod fanin;
pub mod fileserver;
pub mod http;
pub mod logging;
pub mod parser;
pub mod pending;
pub mod pipeline;
pub mod postprocess;
pub mod reactor;
pub mod routing;
pub mod server;
pub mod session;
pub mod speedbench;
pub mod syscalls;

// Re-exports for users
pub use config::Config;
pub use error::{MinuetError, MinuetResult};
pub use fanin::{FanIn, FanInOp};
pub use fileserver::{FileServer, FileServerConfig, FileServerMode};
pub use http::{Method, Request, Response, ResponseState};
pub use pipeline::Exchange;
pub use reactor::{EventHandler, Interest, Reactor, Ready, Repeat};
pub use routing::{RouteHandler, RouteTable};
pub use server::{Server, ServerContext};
pub use session::{Session, SessionHandle, SessionStore};
