// Binary frame codec for the editor sync protocol.
//
// Every socket frame is a varuint message-kind tag (0 = sync, 1 = awareness)
// followed by a kind-specific payload, and a single frame may carry several
// concatenated messages. Encoding and decoding are delegated to the y-sync
// v1 wire format from `yrs::sync`; this module only fixes the framing policy:
// decoding never panics, and an encoder always carries a concrete payload, so
// a tag-only frame cannot be produced.

use yrs::encoding::read::Cursor;
use yrs::sync::{AwarenessUpdate, Message, MessageReader, SyncMessage};
use yrs::updates::decoder::DecoderV1;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

/// Failure to decode an inbound frame. Unrecognized tags and truncated
/// payloads land here; callers log and drop the frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed sync frame: {0}")]
    Frame(#[from] yrs::sync::Error),
    #[error("malformed sync frame: {0}")]
    Read(#[from] yrs::encoding::read::Error),
    #[error("awareness error: {0}")]
    Awareness(#[from] yrs::sync::awareness::Error),
}

/// Decodes one socket frame into the messages it carries.
///
/// The codec is stateless: a frame either decodes fully or the error is
/// returned and nothing is retained.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<Message>, ProtocolError> {
    let mut decoder = DecoderV1::new(Cursor::new(frame));
    let reader = MessageReader::new(&mut decoder);
    let mut messages = Vec::new();
    for message in reader {
        messages.push(message?);
    }
    Ok(messages)
}

/// Frame asking the peer for everything past `state_vector` (sync step 1).
pub fn sync_step1_frame(state_vector: &StateVector) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(state_vector.clone())).encode_v1()
}

/// Frame answering a step-1 request with the missing diff (sync step 2).
pub fn sync_step2_frame(diff: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1()
}

/// Frame carrying an incremental document update.
pub fn update_frame(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

/// Frame carrying a set of awareness (presence) deltas.
pub fn awareness_frame(update: &AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update.clone()).encode_v1()
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::updates::decoder::Decode;
    use yrs::{Doc, GetString, ReadTxn, Text, Transact};

    fn update_for(text: &str) -> Vec<u8> {
        let doc = Doc::with_client_id(7);
        let content = doc.get_or_insert_text("content");
        let mut txn = doc.transact_mut();
        content.push(&mut txn, text);
        txn.encode_update_v1()
    }

    #[test]
    fn update_frame_round_trips() {
        let update = update_for("hello");
        let frame = update_frame(update.clone());

        let messages = decode_frame(&frame).expect("frame should decode");
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Message::Sync(SyncMessage::Update(decoded)) => assert_eq!(decoded, &update),
            other => panic!("expected sync update, got {other:?}"),
        }
    }

    #[test]
    fn sync_step1_frame_round_trips() {
        let doc = Doc::with_client_id(7);
        {
            let content = doc.get_or_insert_text("content");
            let mut txn = doc.transact_mut();
            content.push(&mut txn, "seed");
        }
        let state_vector = doc.transact().state_vector();

        let frame = sync_step1_frame(&state_vector);
        let messages = decode_frame(&frame).expect("frame should decode");
        match &messages[0] {
            Message::Sync(SyncMessage::SyncStep1(decoded)) => assert_eq!(decoded, &state_vector),
            other => panic!("expected sync step 1, got {other:?}"),
        }
    }

    #[test]
    fn frame_may_carry_multiple_messages() {
        let mut frame = sync_step1_frame(&StateVector::default());
        frame.extend(update_frame(update_for("x")));

        let messages = decode_frame(&frame).expect("concatenated frame should decode");
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn garbage_frame_is_an_error_not_a_panic() {
        assert!(decode_frame(&[0xff, 0xff, 0xff, 0x01, 0x02]).is_err());
    }

    #[test]
    fn empty_frame_decodes_to_no_messages() {
        let messages = decode_frame(&[]).expect("empty frame should decode");
        assert!(messages.is_empty());
    }

    #[test]
    fn awareness_frame_round_trips() {
        let awareness = yrs::sync::Awareness::new(Doc::with_client_id(3));
        awareness
            .set_local_state(serde_json::json!({"name": "alice", "cursor": 4}))
            .expect("local state should serialize");
        let update = awareness.update().expect("awareness update should encode");

        let frame = awareness_frame(&update);
        let messages = decode_frame(&frame).expect("frame should decode");
        match &messages[0] {
            Message::Awareness(decoded) => assert!(decoded.clients.contains_key(&3)),
            other => panic!("expected awareness message, got {other:?}"),
        }
    }

    #[test]
    fn applying_decoded_update_reproduces_text() {
        let frame = update_frame(update_for("print('hi')"));
        let messages = decode_frame(&frame).expect("frame should decode");

        let replica = Doc::with_client_id(8);
        for message in messages {
            if let Message::Sync(SyncMessage::Update(update)) = message {
                let decoded = yrs::Update::decode_v1(&update).expect("update should decode");
                replica.transact_mut().apply_update(decoded).expect("update should apply");
            }
        }

        let content = replica.get_or_insert_text("content");
        let txn = replica.transact();
        assert_eq!(content.get_string(&txn), "print('hi')");
    }
}
