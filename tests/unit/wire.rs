use super::*;

#[test]
fn decoder_waits_for_complete_message() {
    let encoded = encode_multipart(&[b"topic".to_vec(), Vec::new(), b"body".to_vec()]);
    let mut decoder = FrameDecoder::new();

    let (head, tail) = encoded.split_at(9);
    decoder.push(head);
    assert!(decoder.next_message().unwrap().is_none());

    decoder.push(tail);
    let frames = decoder.next_message().unwrap().unwrap();
    assert_eq!(frames, vec![b"topic".to_vec(), Vec::new(), b"body".to_vec()]);
    assert_eq!(decoder.pending(), 0);
}

#[test]
fn decoder_splits_back_to_back_messages() {
    let mut bytes = encode_multipart(&[b"a".to_vec()]);
    bytes.extend(encode_multipart(&[b"b".to_vec(), b"c".to_vec()]));
    let mut decoder = FrameDecoder::new();
    decoder.push(&bytes);

    assert_eq!(decoder.next_message().unwrap().unwrap(), vec![b"a".to_vec()]);
    assert_eq!(
        decoder.next_message().unwrap().unwrap(),
        vec![b"b".to_vec(), b"c".to_vec()]
    );
    assert!(decoder.next_message().unwrap().is_none());
}

#[test]
fn decoder_rejects_absurd_frame_count() {
    let mut decoder = FrameDecoder::new();
    decoder.push(&u32::MAX.to_be_bytes());

    let err = decoder.next_message().unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
}

#[test]
fn write_multipart_writes_encoded_bytes() {
    let mut out = Vec::new();
    write_multipart(&mut out, &[b"xy".to_vec()]).unwrap();
    assert_eq!(out, vec![0, 0, 0, 1, 0, 0, 0, 2, b'x', b'y']);
}

#[test]
fn write_multipart_rejects_oversized_frame() {
    let mut out = Vec::new();
    let err = write_multipart(&mut out, &[vec![0u8; MAX_FRAME_LEN + 1]]).unwrap_err();

    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    assert!(out.is_empty());
}
