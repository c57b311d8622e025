use std::fmt;

#[derive(Debug)]
#[allow(dead_code)]
pub enum GatewayError {
    NoRuleMatch,
    RateLimited,
    StoreUnavailable(String),
    UpstreamTimeout,
    UpstreamConnect(String),
    Config(String),
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRuleMatch => write!(f, "no rule matched"),
            GatewayError::RateLimited => write!(f, "rate limit exceeded"),
            GatewayError::StoreUnavailable(msg) => write!(f, "store unavailable: {}", msg),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}
