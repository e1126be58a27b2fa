use super::*;

#[test]
fn test_sha256_from_bytes() {
    let checksum = Checksum::sha256_from_bytes(b"hello world");
    assert_eq!(
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
        checksum.to_hex()
    );
}

#[test]
fn test_hex_round_trip() {
    let hex = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
    let checksum = Checksum::from_hex(hex).unwrap();
    assert_eq!(hex, checksum.to_hex());

    Checksum::from_hex("deadbeef").unwrap_err();
    Checksum::from_hex("not a checksum at all").unwrap_err();
}

#[test]
fn test_serde() {
    let hex = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
    let checksum: Checksum = serde_json::from_str(&format!("\"{}\"", hex)).unwrap();
    assert_eq!(hex, checksum.to_hex());

    let serialized = serde_json::to_string(&checksum).unwrap();
    assert_eq!(format!("\"{}\"", hex), serialized);

    serde_json::from_str::<Checksum>("\"xy\"").unwrap_err();
}
