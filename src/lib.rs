pub mod cache;
pub mod config;
pub mod exception;
pub mod mount;
pub mod param;
pub mod request;
pub mod response;
pub mod server;
pub mod util;
pub mod watcher;

pub use cache::{hash_of, HashCache};
pub use config::Config;
pub use exception::Exception;
pub use mount::Mount;
pub use param::{HttpEncoding, HttpRequestMethod, HttpVersion};
pub use request::Request;
pub use response::Response;
pub use server::{AssetServer, MountHandler, ServeOptions};
pub use watcher::WatchSubscription;
