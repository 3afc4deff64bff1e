//! NNTP response types and status codes

/// NNTP status line with response code and message
#[derive(Debug, Clone)]
pub struct NntpResponse {
    /// 3-digit NNTP response code
    pub code: u16,
    /// Status message from server
    pub message: String,
}

impl NntpResponse {
    /// Check if response indicates success (2xx)
    pub fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// Check if response indicates continuation (3xx)
    pub fn is_continuation(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// Check if response indicates error (4xx or 5xx)
    pub fn is_error(&self) -> bool {
        self.code >= 400
    }
}

/// Parse a status line of the form `NNN message`
pub(crate) fn parse_response_line(line: &str) -> Option<NntpResponse> {
    let code: u16 = line.get(..3)?.parse().ok()?;
    let message = line.get(3..).unwrap_or("").trim().to_string();
    Some(NntpResponse { code, message })
}

/// NNTP response codes (RFC 3977), trimmed to the verbs this crate issues
#[allow(dead_code)]
pub mod codes {
    /// Server date/time (RFC 3977 Section 7.1)
    pub const SERVER_DATE: u16 = 111;
    /// Server ready, posting allowed
    pub const READY_POSTING_ALLOWED: u16 = 200;
    /// Server ready, no posting
    pub const READY_NO_POSTING: u16 = 201;
    /// Article follows
    pub const ARTICLE_FOLLOWS: u16 = 220;
    /// Head follows
    pub const HEAD_FOLLOWS: u16 = 221;
    /// Body follows
    pub const BODY_FOLLOWS: u16 = 222;
    /// Article exists (STAT)
    pub const ARTICLE_STAT: u16 = 223;
    /// Authentication accepted
    pub const AUTH_ACCEPTED: u16 = 281;
    /// Continue with authentication (send AUTHINFO PASS)
    pub const AUTH_CONTINUE: u16 = 381;
    /// No article with that message-id
    pub const NO_SUCH_ARTICLE_ID: u16 = 430;
    /// Authentication required
    pub const AUTH_REQUIRED: u16 = 480;
    /// Authentication rejected
    pub const AUTH_REJECTED: u16 = 481;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_line() {
        let resp = parse_response_line("222 0 <abc@example.com> body follows").unwrap();
        assert_eq!(resp.code, 222);
        assert_eq!(resp.message, "0 <abc@example.com> body follows");
        assert!(resp.is_success());
        assert!(!resp.is_error());
    }

    #[test]
    fn test_parse_bare_code() {
        let resp = parse_response_line("430").unwrap();
        assert_eq!(resp.code, 430);
        assert_eq!(resp.message, "");
        assert!(resp.is_error());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_response_line("oops").is_none());
        assert!(parse_response_line("").is_none());
    }

    #[test]
    fn test_continuation() {
        let resp = parse_response_line("381 password required").unwrap();
        assert!(resp.is_continuation());
    }
}
