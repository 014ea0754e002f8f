pub mod client;
pub mod payload;
pub mod signature;

pub use self::client::{ViberClient, register_webhook};
pub use self::payload::{InboundMessage, MessageContent, ViberEvent};
pub use self::signature::{SIGNATURE_HEADERS, SignatureError, SignatureVerifier};
