fn main() {
    println!("Run `cargo test -p wire-compat` to check the on-wire formats.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use assetlink_protocol::{
        AssetChunk, AssetHeader, ContentKey, Frame, SequencedChunk, decode_frame,
        encode_chunk_frame, encode_sequenced_frame,
    };
    use assetlink_transfer::{OvershootPolicy, TransferConfig, TransferProgress, TransferStatus};

    const ABC_KEY: &str = "900150983cd24fb0d6963f7d28e17f72";

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Deserializes a fixture, re-serializes it, and requires the same JSON
    /// back (field order is ignored).
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
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  ours:    {reserialized}"
        );
        parsed
    }

    fn frame_bytes(header_json: &str, payload: &[u8]) -> Vec<u8> {
        let mut buf = (header_json.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(header_json.as_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    // --- JSON documents ---

    #[test]
    fn fixture_asset_header() {
        let header: AssetHeader = roundtrip_test("asset_header.json");
        assert_eq!(header, AssetHeader::for_bytes("abc", b"abc"));
    }

    #[test]
    fn fixture_transfer_progress() {
        let progress: TransferProgress = roundtrip_test("transfer_progress.json");
        assert_eq!(progress.status, TransferStatus::InProgress);
        assert_eq!(progress.id, ContentKey::compute(b""));
        assert!((progress.percentage() - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fixture_transfer_config() {
        let config: TransferConfig = roundtrip_test("transfer_config.json");
        assert_eq!(config, TransferConfig::default());
        assert_eq!(config.overshoot, OvershootPolicy::Tolerate);
    }

    #[test]
    fn content_key_is_lowercase_hex_string() {
        let key: ContentKey = serde_json::from_str(&format!("\"{}\"", ABC_KEY.to_uppercase()))
            .expect("uppercase hex accepted");
        assert_eq!(serde_json::to_string(&key).unwrap(), format!("\"{ABC_KEY}\""));
    }

    // --- Binary frames ---

    #[test]
    fn plain_frame_layout() {
        let expected = frame_bytes(&format!(r#"{{"id":"{ABC_KEY}"}}"#), b"abc");
        let chunk = AssetChunk::new(ContentKey::compute(b"abc"), b"abc".to_vec());

        assert_eq!(encode_chunk_frame(&chunk).unwrap(), expected);
        assert_eq!(decode_frame(&expected).unwrap(), Frame::Chunk(chunk));
    }

    #[test]
    fn sequenced_frame_layout() {
        let expected = frame_bytes(
            &format!(r#"{{"id":"{ABC_KEY}","index":1,"offset":2}}"#),
            b"c",
        );
        let chunk = SequencedChunk {
            id: ContentKey::compute(b"abc"),
            index: 1,
            offset: 2,
            data: b"c".to_vec(),
        };

        assert_eq!(encode_sequenced_frame(&chunk).unwrap(), expected);
        assert_eq!(decode_frame(&expected).unwrap(), Frame::Sequenced(chunk));
    }

    #[test]
    fn payload_is_raw_bytes() {
        let payload: Vec<u8> = (0..=255).collect();
        let frame = frame_bytes(&format!(r#"{{"id":"{ABC_KEY}"}}"#), &payload);
        match decode_frame(&frame).unwrap() {
            Frame::Chunk(c) => assert_eq!(c.data, payload),
            other => panic!("expected plain chunk, got {other:?}"),
        }
    }
}
