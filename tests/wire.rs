use nfs_mamont_client::protocol::rpc::wire::{
    fragment_header, parse_fragment_header, read_fragment, read_record, write_record,
};
use nfs_mamont_client::protocol::rpc::MAX_RPC_RECORD_LENGTH;
use nfs_mamont_client::RpcError;
use tokio::io::AsyncWriteExt;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn fragment_header_layout() {
    assert_eq!(fragment_header(5, true), [0x80, 0, 0, 5]);
    assert_eq!(fragment_header(0x0102_0304, false), [0x01, 0x02, 0x03, 0x04]);
    assert_eq!(parse_fragment_header([0x80, 0, 1, 0]), (256, true));
    assert_eq!(parse_fragment_header([0x7f, 0xff, 0xff, 0xff]), ((1 << 31) - 1, false));
}

#[tokio::test]
async fn record_split_into_fragments() {
    let mut written = Vec::new();
    write_record(&mut written, b"abcdefg", 3).await.expect("write");
    let expected: Vec<u8> = [
        &[0, 0, 0, 3][..],
        b"abc",
        &[0, 0, 0, 3],
        b"def",
        &[0x80, 0, 0, 1],
        b"g",
    ]
    .concat();
    assert_eq!(written, expected);
}

#[tokio::test]
async fn exact_multiple_has_no_trailing_empty_fragment() {
    let mut written = Vec::new();
    write_record(&mut written, b"abcdef", 3).await.expect("write");
    assert_eq!(written.len(), 2 * 4 + 6);
    assert_eq!(&written[7..11], &[0x80, 0, 0, 3]);
}

#[tokio::test]
async fn empty_record_is_one_last_fragment() {
    let mut written = Vec::new();
    write_record(&mut written, &[], 1024).await.expect("write");
    assert_eq!(written, vec![0x80, 0, 0, 0]);

    let record = read_record(&mut &written[..], MAX_RPC_RECORD_LENGTH).await.expect("read");
    assert!(record.is_empty());
}

#[tokio::test]
async fn records_survive_a_stream_for_any_fragment_size() {
    for max_fragment in [1, 7, 4096, 1 << 20] {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let first = payload(10_000);
        let second = payload(3);
        let sent = (first.clone(), second.clone());
        let writer = tokio::spawn(async move {
            write_record(&mut client, &sent.0, max_fragment).await.expect("write first");
            write_record(&mut client, &sent.1, max_fragment).await.expect("write second");
        });
        let got_first = read_record(&mut server, MAX_RPC_RECORD_LENGTH).await.expect("first");
        let got_second = read_record(&mut server, MAX_RPC_RECORD_LENGTH).await.expect("second");
        writer.await.expect("writer");
        assert_eq!(got_first, first, "max_fragment {}", max_fragment);
        assert_eq!(got_second, second, "max_fragment {}", max_fragment);
    }
}

#[tokio::test]
async fn oversized_record_is_refused() {
    let mut written = Vec::new();
    write_record(&mut written, &payload(100), 40).await.expect("write");
    match read_record(&mut &written[..], 64).await {
        Err(RpcError::RecordTooLarge { length, max }) => {
            assert_eq!(length, 80);
            assert_eq!(max, 64);
        }
        other => panic!("expected RecordTooLarge, got {:?}", other),
    }
}

#[tokio::test]
async fn eof_inside_a_record_aborts() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    client.write_all(&fragment_header(10, true)).await.expect("header");
    client.write_all(b"abc").await.expect("partial body");
    drop(client);
    assert!(matches!(
        read_record(&mut server, MAX_RPC_RECORD_LENGTH).await,
        Err(RpcError::Aborted)
    ));
}

#[tokio::test]
async fn eof_before_a_header_aborts() {
    let mut empty: &[u8] = &[];
    let mut record = Vec::new();
    assert!(matches!(
        read_fragment(&mut empty, &mut record, MAX_RPC_RECORD_LENGTH).await,
        Err(RpcError::Aborted)
    ));
}

#[tokio::test]
async fn fragments_append_to_the_buffer() {
    let mut written = Vec::new();
    write_record(&mut written, b"hello world", 5).await.expect("write");
    let mut src = &written[..];
    let mut record = b"xx".to_vec();
    assert!(!read_fragment(&mut src, &mut record, MAX_RPC_RECORD_LENGTH).await.expect("one"));
    assert_eq!(record, b"xxhello");
    assert!(!read_fragment(&mut src, &mut record, MAX_RPC_RECORD_LENGTH).await.expect("two"));
    assert!(read_fragment(&mut src, &mut record, MAX_RPC_RECORD_LENGTH).await.expect("three"));
    assert_eq!(record, b"xxhello world");
}
