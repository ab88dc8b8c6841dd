mod gateway;
mod rewrite;
mod server;

pub use gateway::{prepare_request_headers, sanitize_response_headers};
pub use rewrite::{
    Rewrite, count_tokens, extract_credential, is_eligible, message_text, parse_body,
    rewrite_messages,
};
pub use server::{AppState, ProxyServer, create_router};
