//! Newline-delimited JSON framing for byte-stream transports.

use super::{BridgeError, RpcRequest};

/// Reassembles complete lines from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line it completed. The trailing
    /// fragment stays buffered for the next chunk. Blank lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|byte| *byte == b'\n') else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete
            .split(|byte| *byte == b'\n')
            .map(|line| String::from_utf8_lossy(line).trim().to_string())
            .filter(|line| !line.is_empty())
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

pub fn encode_line(request: &RpcRequest) -> Result<Vec<u8>, BridgeError> {
    let mut bytes =
        serde_json::to_vec(request).map_err(|err| BridgeError::Encode(err.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keeps_partial_line_until_completed() {
        let mut framer = LineFramer::new();
        assert!(framer.push(br#"{"id": 1, "res"#).is_empty());
        assert_eq!(framer.pending_len(), 14);

        let lines = framer.push(b"ult\": 2}\n{\"id\": 2");
        assert_eq!(lines, vec![r#"{"id": 1, "result": 2}"#.to_string()]);

        let lines = framer.push(b"}\n");
        assert_eq!(lines, vec![r#"{"id": 2}"#.to_string()]);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn splits_many_lines_in_one_chunk() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"a\r\n\nb\nc\nd");
        assert_eq!(lines, vec!["a", "b", "c"]);
        assert_eq!(framer.pending_len(), 1);
    }

    #[test]
    fn encodes_one_line_per_request() {
        let request = RpcRequest {
            id: 3,
            method: "get_csv_files".into(),
            params: json!({"folder": "."}),
        };
        let bytes = encode_line(&request).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
    }
}
