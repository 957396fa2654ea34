use thiserror::Error;

/// Keys longer than this are rejected by both protocols.
pub const KEY_MAX_LENGTH: usize = 250;

/// A command line tokenizes to at most this many fields. Multi-key `get`
/// lines are the exception: everything after the verb is a key.
pub const MAX_TOKENS: usize = 8;

pub const CRLF: &[u8] = b"\r\n";

/// The reply tokens clients pattern-match on. Load-bearing; byte-exact.
pub mod reply {
    pub const STORED: &[u8] = b"STORED\r\n";
    pub const NOT_STORED: &[u8] = b"NOT_STORED\r\n";
    pub const EXISTS: &[u8] = b"EXISTS\r\n";
    pub const NOT_FOUND: &[u8] = b"NOT_FOUND\r\n";
    pub const DELETED: &[u8] = b"DELETED\r\n";
    pub const OK: &[u8] = b"OK\r\n";
    pub const ERROR: &[u8] = b"ERROR\r\n";
    pub const END: &[u8] = b"END\r\n";
    pub const RESET: &[u8] = b"RESET\r\n";
    pub const VALUE: &[u8] = b"VALUE ";
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Surfaced as `CLIENT_ERROR bad command line format`.
    #[error("bad command line format")]
    BadFormat,
    /// Surfaced as `CLIENT_ERROR invalid numeric delta argument`.
    #[error("invalid numeric delta argument")]
    BadDelta,
    /// Surfaced as the bare `ERROR` token.
    #[error("unknown command")]
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

/// One parsed text-protocol command; slices borrow the request line.
#[derive(Debug, PartialEq, Eq)]
pub enum TextCommand<'a> {
    Get {
        keys: Vec<&'a [u8]>,
        with_cas: bool,
    },
    Store {
        kind: StoreKind,
        key: &'a [u8],
        flags: u32,
        exptime: i64,
        bytes: usize,
        cas_id: u64,
        noreply: bool,
    },
    Delete {
        key: &'a [u8],
        noreply: bool,
    },
    Arith {
        key: &'a [u8],
        delta: u64,
        incr: bool,
        noreply: bool,
    },
    Stats {
        args: Vec<&'a [u8]>,
    },
    FlushAll {
        delay: Option<i64>,
        noreply: bool,
    },
    Verbosity {
        level: u8,
        noreply: bool,
    },
    Version,
    Quit,
}

/// Finds one complete line in `buf`. Returns the line without its
/// terminator (an optional `\r` before the `\n` is stripped) and the number
/// of bytes consumed including the terminator.
pub fn find_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let nl = buf.iter().position(|&b| b == b'\n')?;
    let line = if nl > 0 && buf[nl - 1] == b'\r' { &buf[..nl - 1] } else { &buf[..nl] };
    Some((line, nl + 1))
}

pub fn parse_command(line: &[u8]) -> Result<TextCommand<'_>, ParseError> {
    let mut tokens = line.split(|&b| b == b' ').filter(|t| !t.is_empty());
    let verb = tokens.next().ok_or(ParseError::Unknown)?;

    match verb {
        b"get" | b"gets" => {
            let keys: Vec<&[u8]> = tokens.collect();
            if keys.is_empty() || keys.iter().any(|k| k.len() > KEY_MAX_LENGTH) {
                return Err(ParseError::BadFormat);
            }
            Ok(TextCommand::Get { keys, with_cas: verb == b"gets".as_slice() })
        }
        b"set" | b"add" | b"replace" | b"append" | b"prepend" | b"cas" => {
            let kind = match verb {
                b"set" => StoreKind::Set,
                b"add" => StoreKind::Add,
                b"replace" => StoreKind::Replace,
                b"append" => StoreKind::Append,
                b"prepend" => StoreKind::Prepend,
                _ => StoreKind::Cas,
            };
            let rest = collect_tokens(tokens)?;
            let (rest, noreply) = strip_noreply(rest);
            let want = if kind == StoreKind::Cas { 5 } else { 4 };
            if rest.len() != want {
                return Err(ParseError::BadFormat);
            }
            let key = checked_key(rest[0])?;
            let flags = parse_num::<u32>(rest[1], ParseError::BadFormat)?;
            let exptime = parse_num::<i64>(rest[2], ParseError::BadFormat)?;
            // u32 keeps hostile length fields from overflowing size math.
            let bytes = parse_num::<u32>(rest[3], ParseError::BadFormat)? as usize;
            let cas_id =
                if kind == StoreKind::Cas { parse_num::<u64>(rest[4], ParseError::BadFormat)? } else { 0 };
            Ok(TextCommand::Store { kind, key, flags, exptime, bytes, cas_id, noreply })
        }
        b"delete" => {
            let rest = collect_tokens(tokens)?;
            let (rest, noreply) = strip_noreply(rest);
            if rest.len() != 1 {
                return Err(ParseError::BadFormat);
            }
            Ok(TextCommand::Delete { key: checked_key(rest[0])?, noreply })
        }
        b"incr" | b"decr" => {
            let rest = collect_tokens(tokens)?;
            let (rest, noreply) = strip_noreply(rest);
            if rest.len() != 2 {
                return Err(ParseError::BadFormat);
            }
            let key = checked_key(rest[0])?;
            let delta = parse_num::<u64>(rest[1], ParseError::BadDelta)?;
            Ok(TextCommand::Arith { key, delta, incr: verb == b"incr".as_slice(), noreply })
        }
        b"stats" => {
            let args = collect_tokens(tokens)?;
            Ok(TextCommand::Stats { args })
        }
        b"flush_all" => {
            let rest = collect_tokens(tokens)?;
            let (rest, noreply) = strip_noreply(rest);
            let delay = match rest.len() {
                0 => None,
                1 => Some(parse_num::<i64>(rest[0], ParseError::BadFormat)?),
                _ => return Err(ParseError::BadFormat),
            };
            Ok(TextCommand::FlushAll { delay, noreply })
        }
        b"verbosity" => {
            let rest = collect_tokens(tokens)?;
            let (rest, noreply) = strip_noreply(rest);
            if rest.len() != 1 {
                return Err(ParseError::BadFormat);
            }
            let level = parse_num::<u8>(rest[0], ParseError::BadFormat)?;
            Ok(TextCommand::Verbosity { level, noreply })
        }
        b"version" => Ok(TextCommand::Version),
        b"quit" => Ok(TextCommand::Quit),
        _ => Err(ParseError::Unknown),
    }
}

fn collect_tokens<'a>(
    tokens: impl Iterator<Item = &'a [u8]>,
) -> Result<Vec<&'a [u8]>, ParseError> {
    let mut out = Vec::new();
    for token in tokens {
        if out.len() >= MAX_TOKENS - 1 {
            return Err(ParseError::BadFormat);
        }
        out.push(token);
    }
    Ok(out)
}

fn strip_noreply(mut tokens: Vec<&[u8]>) -> (Vec<&[u8]>, bool) {
    let noreply = tokens.last().is_some_and(|t| *t == b"noreply".as_slice());
    if noreply {
        tokens.pop();
    }
    (tokens, noreply)
}

fn checked_key(key: &[u8]) -> Result<&[u8], ParseError> {
    if key.is_empty() || key.len() > KEY_MAX_LENGTH {
        return Err(ParseError::BadFormat);
    }
    Ok(key)
}

fn parse_num<T: std::str::FromStr>(token: &[u8], err: ParseError) -> Result<T, ParseError> {
    std::str::from_utf8(token).ok().and_then(|s| s.parse().ok()).ok_or(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_terminators() {
        assert_eq!(find_line(b"get foo\r\nrest"), Some((&b"get foo"[..], 9)));
        assert_eq!(find_line(b"get foo\nrest"), Some((&b"get foo"[..], 8)));
        assert_eq!(find_line(b"get fo"), None);
    }

    #[test]
    fn get_multi_key() {
        let cmd = parse_command(b"get a b c").unwrap();
        assert_eq!(
            cmd,
            TextCommand::Get { keys: vec![b"a".as_slice(), b"b", b"c"], with_cas: false }
        );
        assert!(matches!(parse_command(b"gets a").unwrap(), TextCommand::Get { with_cas: true, .. }));
        // More keys than the token cap is fine for get.
        let many = parse_command(b"get a b c d e f g h i j").unwrap();
        assert!(matches!(many, TextCommand::Get { ref keys, .. } if keys.len() == 10));
    }

    #[test]
    fn set_grammar() {
        let cmd = parse_command(b"set foo 7 60 6").unwrap();
        assert_eq!(
            cmd,
            TextCommand::Store {
                kind: StoreKind::Set,
                key: b"foo",
                flags: 7,
                exptime: 60,
                bytes: 6,
                cas_id: 0,
                noreply: false,
            }
        );
        assert!(matches!(
            parse_command(b"set foo 0 0 6 noreply").unwrap(),
            TextCommand::Store { noreply: true, .. }
        ));
        assert_eq!(parse_command(b"set foo 0 0").unwrap_err(), ParseError::BadFormat);
        assert_eq!(parse_command(b"set foo 0 0 abc").unwrap_err(), ParseError::BadFormat);
    }

    #[test]
    fn cas_takes_an_id() {
        let cmd = parse_command(b"cas foo 0 0 3 42").unwrap();
        assert!(matches!(cmd, TextCommand::Store { kind: StoreKind::Cas, cas_id: 42, .. }));
        assert_eq!(parse_command(b"cas foo 0 0 3").unwrap_err(), ParseError::BadFormat);
    }

    #[test]
    fn arith_delta_errors_are_typed() {
        assert!(matches!(
            parse_command(b"incr n 3").unwrap(),
            TextCommand::Arith { incr: true, delta: 3, .. }
        ));
        assert_eq!(parse_command(b"incr n x").unwrap_err(), ParseError::BadDelta);
        assert_eq!(parse_command(b"decr n -1").unwrap_err(), ParseError::BadDelta);
    }

    #[test]
    fn oversized_key_rejected() {
        let key = vec![b'k'; KEY_MAX_LENGTH + 1];
        let mut line = b"delete ".to_vec();
        line.extend_from_slice(&key);
        assert_eq!(parse_command(&line).unwrap_err(), ParseError::BadFormat);

        let mut line = b"get ".to_vec();
        line.extend_from_slice(&key);
        assert_eq!(parse_command(&line).unwrap_err(), ParseError::BadFormat);
    }

    #[test]
    fn unknown_verbs() {
        assert_eq!(parse_command(b"slabs reassign 1 2").unwrap_err(), ParseError::Unknown);
        assert_eq!(parse_command(b"bogus").unwrap_err(), ParseError::Unknown);
        assert_eq!(parse_command(b"").unwrap_err(), ParseError::Unknown);
    }

    #[test]
    fn flush_all_delay() {
        assert_eq!(
            parse_command(b"flush_all").unwrap(),
            TextCommand::FlushAll { delay: None, noreply: false }
        );
        assert_eq!(
            parse_command(b"flush_all 30 noreply").unwrap(),
            TextCommand::FlushAll { delay: Some(30), noreply: true }
        );
    }

    #[test]
    fn token_cap_applies_to_commands() {
        assert_eq!(
            parse_command(b"set k 0 0 1 noreply extra junk tokens here").unwrap_err(),
            ParseError::BadFormat
        );
    }
}
