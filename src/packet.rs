/* Packet verification contract shared by every driver's reader loop.
 *
 * Each driver supplies a `PacketVerifier` that looks at a growing prefix of
 * bytes read off the transport and tells the reader loop what to do next.
 * The reader loop itself lives in `driver::framing` and is the same for
 * every driver; only the verifier and the builder differ per protocol. */

/* Outcome of feeding one more byte (or the whole prefix so far) to a
 * driver's verifier: `{invalid, need-more, include-and-continue,
 * include-and-finish}`. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /* The prefix can never become a valid packet; drop it and resync. */
    Invalid,
    /* Valid so far but incomplete. If `total_len` is known, the reader can
     * short-circuit straight to reading the remaining bytes. */
    NeedMore { total_len: Option<usize> },
    /* Valid so far and still growing; keep reading one byte at a time. */
    IncludeAndContinue,
    /* The prefix is a complete, verified packet. */
    IncludeAndFinish,
}

/* A driver-supplied packet verifier: takes the bytes accumulated so far
 * and returns a `Verdict`. Implementations must be pure functions of the
 * prefix — no driver is allowed to stash state outside of it, per the
 * "buffered packet read with re-entrant state" design note. */
pub trait PacketVerifier {
    fn verify(&self, bytes: &[u8]) -> Verdict;
}

/* Blanket impl so a plain closure can serve as a `PacketVerifier`, used
 * heavily by the per-driver framing modules to keep each driver's file
 * free of one-off trait impls. */
impl<F> PacketVerifier for F
where
    F: Fn(&[u8]) -> Verdict,
{
    fn verify(&self, bytes: &[u8]) -> Verdict {
        self(bytes)
    }
}

/* Drains bytes out of a scratch buffer against a verifier, delivering
 * complete packets and discarding invalid prefixes. Used by every driver's
 * `read_command` so the byte-at-a-time resync logic is written exactly
 * once. */
pub struct PacketReader {
    scratch: Vec<u8>,
    ignored_bytes: u64,
}

impl PacketReader {
    pub fn new() -> Self {
        Self {
            scratch: Vec::with_capacity(64),
            ignored_bytes: 0,
        }
    }

    /* Total bytes dropped while resynchronizing, exposed for diagnostics. */
    pub fn ignored_bytes(&self) -> u64 {
        self.ignored_bytes
    }

    /* Feed one freshly-read byte in. Returns `Some(packet)` once the
     * verifier reports `IncludeAndFinish`, taking the completed packet out
     * of the scratch buffer and leaving it empty for the next frame. */
    pub fn push(&mut self, byte: u8, verifier: &dyn PacketVerifier) -> Option<Vec<u8>> {
        self.scratch.push(byte);

        loop {
            match verifier.verify(&self.scratch) {
                Verdict::Invalid => {
                    /* Drop exactly one byte from the front and keep trying —
                     * this is what lets us resynchronize mid-garbage instead
                     * of discarding the whole scratch buffer, which could
                     * throw away the start of a real frame. */
                    if self.scratch.is_empty() {
                        return None;
                    }
                    self.scratch.remove(0);
                    self.ignored_bytes += 1;
                    if self.scratch.is_empty() {
                        return None;
                    }
                    continue;
                }
                Verdict::NeedMore { .. } | Verdict::IncludeAndContinue => return None,
                Verdict::IncludeAndFinish => {
                    return Some(std::mem::take(&mut self.scratch));
                }
            }
        }
    }
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /* A tiny made-up framing: `[0xAA, len, ...len bytes..., checksum]`. */
    fn verifier(bytes: &[u8]) -> Verdict {
        if bytes.is_empty() {
            return Verdict::NeedMore { total_len: None };
        }
        if bytes[0] != 0xAA {
            return Verdict::Invalid;
        }
        if bytes.len() < 2 {
            return Verdict::NeedMore { total_len: None };
        }
        let len = bytes[1] as usize;
        let total = 2 + len + 1;
        if bytes.len() < total {
            return Verdict::NeedMore {
                total_len: Some(total),
            };
        }
        if bytes.len() > total {
            return Verdict::Invalid;
        }
        let checksum: u8 = bytes[2..2 + len].iter().fold(0u8, |a, b| a ^ b);
        if checksum == bytes[total - 1] {
            Verdict::IncludeAndFinish
        } else {
            Verdict::Invalid
        }
    }

    #[test]
    fn delivers_one_clean_frame() {
        let mut reader = PacketReader::new();
        let frame = [0xAA, 0x02, 0x01, 0x02, 0x01 ^ 0x02];
        let mut out = None;
        for b in frame {
            out = reader.push(b, &verifier);
        }
        assert_eq!(out, Some(frame.to_vec()));
    }

    #[test]
    fn resyncs_past_garbage() {
        let mut reader = PacketReader::new();
        let garbage = [0x01, 0x02, 0x03];
        let frame = [0xAA, 0x01, 0x05, 0x05];
        let mut delivered = None;
        for b in garbage.into_iter().chain(frame.into_iter()) {
            if let Some(p) = reader.push(b, &verifier) {
                delivered = Some(p);
            }
        }
        assert_eq!(delivered, Some(frame.to_vec()));
        assert_eq!(reader.ignored_bytes(), garbage.len() as u64);
    }

    #[test]
    fn drops_bad_checksum_without_delivery() {
        let mut reader = PacketReader::new();
        let bad = [0xAA, 0x01, 0x05, 0x00];
        let mut delivered = None;
        for b in bad {
            if let Some(p) = reader.push(b, &verifier) {
                delivered = Some(p);
            }
        }
        assert_eq!(delivered, None);
    }
}
