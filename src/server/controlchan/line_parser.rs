//! Parsing and normalization for FTP control lines, both directions.

use crate::server::error::ProxyError;

pub(crate) const SECURE_COMMAND: &str = "PASS";

// FTP commands always start with an alphabetic byte; some clients prefix
// them with telnet control bytes (e.g. "\xff\xf4\xffABOR"). Stripping is
// bounded so a stream of pure junk cannot spin here.
const MAX_LEADING_JUNK: usize = 128;

/// Splits a command line into its upper-cased verb and the remainder with
/// original casing. The line terminator is not part of either.
pub(crate) fn parse_command(line: &str) -> (String, String) {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    match trimmed.split_once(' ') {
        Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.to_string()),
        None => (trimmed.to_ascii_uppercase(), String::new()),
    }
}

/// Normalizes a command line before it is sent to an origin: leading
/// non-alphabetic bytes are removed and the line is made to end in exactly
/// one CRLF. A line with no alphabetic start within reach fails.
pub(crate) fn normalize_command_line(line: &str) -> Result<String, ProxyError> {
    let mut stripped = 0;
    let mut rest = line;
    loop {
        match rest.chars().next() {
            None => return Err(ProxyError::BadCommandLine),
            Some(c) if c.is_ascii_alphabetic() => break,
            Some(c) => {
                if stripped == MAX_LEADING_JUNK {
                    return Err(ProxyError::BadCommandLine);
                }
                stripped += 1;
                rest = &rest[c.len_utf8()..];
            }
        }
    }

    // command line must contain CRLF exactly once, at the end
    let well_formed = rest.ends_with("\r\n") && rest.matches('\r').count() == 1 && rest.matches('\n').count() == 1;
    if well_formed {
        return Ok(rest.to_string());
    }

    let mut cleaned: String = rest.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    cleaned.push_str("\r\n");
    Ok(cleaned)
}

/// Extracts the three digit reply code and the separator byte (`b' '` for a
/// terminal line, `b'-'` for a multi-line opener) from a reply line.
pub(crate) fn parse_reply_code(line: &[u8]) -> Option<(u16, u8)> {
    if line.len() < 4 {
        return None;
    }
    let digits = &line[..3];
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code = digits.iter().fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'));
    Some((code, line[3]))
}

/// Returns the line with any `PASS` argument replaced, ready for logs and
/// events. The line terminator is dropped either way.
pub(crate) fn redact(line: &str) -> String {
    let (verb, _) = parse_command(line);
    if verb == SECURE_COMMAND {
        format!("{} ********", SECURE_COMMAND)
    } else {
        line.trim_end_matches(['\r', '\n']).to_string()
    }
}
