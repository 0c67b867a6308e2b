fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use chua_protocol::messages::{
        ChunkAckResponse, CompleteErrorResponse, CompleteResponse, OpenSessionRequest,
        OpenSessionResponse,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (order-independent comparison).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  wire: {fixture}\n  Rust: {reserialized}"
        );
        parsed
    }

    #[test]
    fn fixture_open_session_request() {
        let req: OpenSessionRequest = roundtrip_test("open_session_request.json");
        assert_eq!(req.chunk_count, 10);
        assert_eq!(req.file_size, 10_000_000);
    }

    #[test]
    fn fixture_open_session_response() {
        let resp: OpenSessionResponse = roundtrip_test("open_session_response.json");
        assert!(!resp.duplicated);
        assert_eq!(
            resp.session_id.to_string(),
            "67e55044-10b1-426f-9247-bb680e5fe0c8"
        );
    }

    #[test]
    fn fixture_open_session_response_duplicated() {
        let resp: OpenSessionResponse = roundtrip_test("open_session_response_duplicated.json");
        assert!(resp.duplicated);
    }

    #[test]
    fn fixture_chunk_ack_response() {
        let ack: ChunkAckResponse = roundtrip_test("chunk_ack_response.json");
        assert!(ack.accepted);
        assert_eq!(ack.index, Some(3));
        assert_eq!(ack.server_checksum, chua_protocol::checksum_bytes(b""));
    }

    #[test]
    fn fixture_complete_response() {
        let _: CompleteResponse = roundtrip_test("complete_response.json");
    }

    #[test]
    fn fixture_complete_error_response() {
        let err: CompleteErrorResponse = roundtrip_test("complete_error_response.json");
        assert_eq!(err.missing_indices, vec![2, 7]);
    }

    #[test]
    fn chunk_ack_tolerates_unknown_fields() {
        let ack: ChunkAckResponse = serde_json::from_str(
            r#"{"accepted":false,"serverChecksum":"","storedAt":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(!ack.accepted);
    }

    #[test]
    fn all_fixtures_parse_as_json() {
        for entry in fs::read_dir(fixtures_dir()).unwrap() {
            let path = entry.unwrap().path();
            if path.extension().is_some_and(|e| e == "json") {
                let name = path.file_name().unwrap().to_string_lossy().to_string();
                let _ = load_fixture(&name);
            }
        }
    }
}
