use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// One frame of Git's pkt-line framing: a 4-hex-digit length prefix
/// (counting itself) followed by payload, with three reserved sentinels.
#[derive(Debug, PartialEq, Eq)]
pub enum Pkt<'a> {
    Data(&'a [u8]),
    Flush,
    Delim,
    ResponseEnd,
}

/// Borrowing reader over a pkt-line stream.
pub struct PktReader<'a> {
    buf: &'a [u8],
}

impl<'a> PktReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for PktReader<'a> {
    type Item = Result<Pkt<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        if self.buf.len() < 4 {
            self.buf = &[];
            return Some(Err(Error::Protocol("truncated pkt-line length".into())));
        }
        let (head, rest) = self.buf.split_at(4);
        let len = match std::str::from_utf8(head)
            .ok()
            .and_then(|digits| usize::from_str_radix(digits, 16).ok())
        {
            Some(len) => len,
            None => {
                self.buf = &[];
                return Some(Err(Error::Protocol(format!(
                    "invalid pkt-line length {:?}",
                    String::from_utf8_lossy(head)
                ))));
            }
        };
        match len {
            0 => {
                self.buf = rest;
                Some(Ok(Pkt::Flush))
            }
            1 => {
                self.buf = rest;
                Some(Ok(Pkt::Delim))
            }
            2 => {
                self.buf = rest;
                Some(Ok(Pkt::ResponseEnd))
            }
            3 => {
                self.buf = &[];
                Some(Err(Error::Protocol("invalid pkt-line length 0003".into())))
            }
            len => {
                let payload_len = len - 4;
                if rest.len() < payload_len {
                    self.buf = &[];
                    return Some(Err(Error::Protocol(
                        "pkt-line length exceeds remaining body".into(),
                    )));
                }
                let (payload, rest) = rest.split_at(payload_len);
                self.buf = rest;
                Some(Ok(Pkt::Data(payload)))
            }
        }
    }
}

/// A classified protocol-v2 `git-upload-pack` request body.
#[derive(Debug)]
pub enum Command {
    LsRefs,
    Fetch(FetchCommand),
    Unknown,
}

/// The canonical argument set of a v2 `fetch` command.
///
/// Sorted sets make the derived fingerprint independent of the order (and
/// duplication) of the lines a particular client happened to send.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FetchCommand {
    pub wants: BTreeSet<String>,
    pub haves: BTreeSet<String>,
    pub opts: BTreeSet<String>,
}

impl FetchCommand {
    /// Hex SHA-256 over the canonical form: sorted `want`s, then sorted
    /// `have`s, then sorted options, one LF-terminated line each.
    ///
    /// Two bodies with the same fingerprint request the same pack, so one
    /// upstream pack computation can satisfy both.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for want in &self.wants {
            hasher.update(b"want ");
            hasher.update(want.as_bytes());
            hasher.update(b"\n");
        }
        for have in &self.haves {
            hasher.update(b"have ");
            hasher.update(have.as_bytes());
            hasher.update(b"\n");
        }
        for opt in &self.opts {
            hasher.update(opt.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// Classify a `git-upload-pack` POST body.
///
/// Only protocol v2 bodies are understood. Anything else, including protocol
/// v0 requests (which carry no `command=` line) and commands introduced
/// after this was written, is `Unknown` and gets proxied upstream untouched.
/// Malformed pkt-line framing is an error; we won't forward what we cannot
/// frame.
pub fn classify(body: &[u8]) -> Result<Command> {
    let mut command: Option<String> = None;
    let mut in_args = false;
    let mut fetch = FetchCommand::default();

    for pkt in PktReader::new(body) {
        match pkt? {
            Pkt::Data(payload) => {
                let payload = match payload.last() {
                    Some(b'\n') => &payload[..payload.len() - 1],
                    _ => payload,
                };
                let Ok(line) = std::str::from_utf8(payload) else {
                    continue;
                };
                if !in_args {
                    // command and capability section; capabilities (agent=,
                    // object-format=, ...) don't identify the requested pack
                    if let Some(name) = line.strip_prefix("command=") {
                        command = Some(name.to_owned());
                    }
                } else if command.as_deref() == Some("fetch") {
                    collect_fetch_arg(&mut fetch, line);
                }
            }
            Pkt::Delim => in_args = true,
            // a stateless request carries one command section
            Pkt::Flush | Pkt::ResponseEnd => break,
        }
    }

    match command.as_deref() {
        Some("fetch") => Ok(Command::Fetch(fetch)),
        Some("ls-refs") => Ok(Command::LsRefs),
        _ => Ok(Command::Unknown),
    }
}

fn collect_fetch_arg(fetch: &mut FetchCommand, line: &str) {
    if let Some(sha) = line.strip_prefix("want ") {
        fetch.wants.insert(sha.trim().to_ascii_lowercase());
    } else if let Some(sha) = line.strip_prefix("have ") {
        fetch.haves.insert(sha.trim().to_ascii_lowercase());
    } else if let Some(sha) = line.strip_prefix("shallow ") {
        fetch
            .opts
            .insert(format!("shallow {}", sha.trim().to_ascii_lowercase()));
    } else if matches!(
        line,
        "done" | "thin-pack" | "no-progress" | "include-tag" | "ofs-delta"
    ) {
        fetch.opts.insert(line.to_owned());
    } else if line.starts_with("filter ")
        || line.starts_with("deepen ")
        || line.starts_with("deepen-since ")
        || line.starts_with("deepen-not ")
    {
        fetch.opts.insert(line.to_owned());
    }
    // anything else (want-ref, sideband-all, packfile-uris, ...) still rides
    // along in the raw body handed to git-upload-pack, it just doesn't
    // contribute to the fingerprint
}
