//! Transport-safe encodings for slab-to-slab messages.
//!
//! Packets travel as JSON strings so that nothing but plain data crosses
//! the mesh. Payload references are rewritten to the referenced entity's id
//! string; the `$` key prefix is what marks them as references again on
//! the receiving side. Slabs refuse to store a memo whose payload breaks
//! that convention, so every stored memo survives the trip unchanged.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::id::{EntityId, MemoId, RecordId, SlabId};
use crate::memo::Memo;
use crate::peering::{PeeringDeltas, Peerings};
use crate::value::{Payload, Value, REF_KEY_PREFIX};

/// A memo in flight, with the sender's peering view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoPacket {
    pub id: MemoId,
    pub record_id: RecordId,
    pub parents: Vec<MemoId>,
    pub payload: BTreeMap<String, serde_json::Value>,
    pub replica_target: usize,
    pub peerings: Peerings,
}

impl MemoPacket {
    /// Flatten a memo for the wire.
    pub fn from_memo(memo: &Memo, peerings: Peerings) -> Self {
        let payload = memo
            .payload()
            .iter()
            .map(|(key, value)| {
                let raw = match value {
                    Value::Scalar(v) => v.clone(),
                    Value::Ref(id) => serde_json::Value::String(id.to_string()),
                };
                (key.clone(), raw)
            })
            .collect();

        Self {
            id: memo.id().clone(),
            record_id: memo.record_id().clone(),
            parents: memo.parents().iter().cloned().collect(),
            payload,
            replica_target: memo.replica_target(),
            peerings,
        }
    }

    /// Rebuild the memo and hand back the carried peerings.
    ///
    /// A `$` field whose value is not an entity id comes back as a scalar,
    /// which the receiving slab then refuses to store.
    pub fn into_memo(self) -> (Memo, Peerings) {
        let payload: Payload = self
            .payload
            .into_iter()
            .map(|(key, raw)| {
                let value = match (&raw, key.starts_with(REF_KEY_PREFIX)) {
                    (serde_json::Value::String(s), true) => match s.parse::<EntityId>() {
                        Ok(id) => Value::Ref(id),
                        Err(_) => Value::Scalar(raw),
                    },
                    _ => Value::Scalar(raw),
                };
                (key, value)
            })
            .collect();

        let parents: BTreeSet<MemoId> = self.parents.into_iter().collect();
        let memo = Memo::new(self.id, self.record_id, parents, payload, self.replica_target);
        (memo, self.peerings)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A peering-change message: the sender's own state per memo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "peer")]
pub struct PeeringMessage {
    pub from: SlabId,
    pub to: SlabId,
    pub deltas: PeeringDeltas,
}

impl PeeringMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A request for memos the sender wants back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "request")]
pub struct MemoRequest {
    pub from: SlabId,
    pub to: SlabId,
    pub ids: Vec<MemoId>,
}

impl MemoRequest {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peering::PeerState;
    use crate::value::payload;

    fn sample_memo() -> Memo {
        let mut p = payload([("animal_sound", "moo")]);
        p.insert("$owner".into(), Value::from("R.B-1".parse::<RecordId>().unwrap()));
        p.insert("twin".into(), Value::from("A-9"));
        let parents = ["A-1".parse().unwrap()].into_iter().collect();
        Memo::new("A-2".parse().unwrap(), "R.A-0".parse().unwrap(), parents, p, 3)
    }

    #[test]
    fn refs_are_rewritten_to_id_strings() {
        let packet = MemoPacket::from_memo(&sample_memo(), Peerings::new());
        assert_eq!(packet.payload["$owner"], serde_json::json!("R.B-1"));
        assert_eq!(packet.payload["animal_sound"], serde_json::json!("moo"));
    }

    #[test]
    fn id_strings_under_plain_keys_stay_scalars() {
        let raw = MemoPacket::from_memo(&sample_memo(), Peerings::new()).encode().unwrap();
        let (back, _) = MemoPacket::decode(&raw).unwrap().into_memo();
        assert_eq!(back.get("twin"), Some(&Value::from("A-9")));
        assert!(back.get("$owner").is_some_and(Value::is_ref));
    }

    #[test]
    fn dollar_fields_that_are_not_ids_fail_validation() {
        let mut packet = MemoPacket::from_memo(&sample_memo(), Peerings::new());
        packet
            .payload
            .insert("$owner".into(), serde_json::json!("not an id"));
        let (memo, _) = packet.into_memo();
        assert!(matches!(
            memo.validate(),
            Err(crate::Error::InvalidPayload { ref field }) if field == "$owner"
        ));
    }

    #[test]
    fn packet_survives_the_wire() {
        let memo = sample_memo();
        let mut peerings = Peerings::new();
        peerings
            .entry(memo.id().clone())
            .or_default()
            .insert(SlabId::new("A").unwrap(), PeerState::Holding);

        let raw = MemoPacket::from_memo(&memo, peerings.clone()).encode().unwrap();
        let (back, carried) = MemoPacket::decode(&raw).unwrap().into_memo();

        assert_eq!(back, memo);
        assert_eq!(carried, peerings);
    }

    #[test]
    fn peering_message_is_tagged() {
        let msg = PeeringMessage {
            from: SlabId::new("A").unwrap(),
            to: SlabId::new("B").unwrap(),
            deltas: [("A-1".parse().unwrap(), PeerState::Holding)].into_iter().collect(),
        };
        let raw = msg.encode().unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["type"], "peer");
        assert_eq!(json["deltas"]["A-1"], 2);
        assert_eq!(PeeringMessage::decode(&raw).unwrap(), msg);
    }

    #[test]
    fn memo_request_is_tagged() {
        let request = MemoRequest {
            from: SlabId::new("A").unwrap(),
            to: SlabId::new("B").unwrap(),
            ids: vec!["A-1".parse().unwrap()],
        };
        let raw = request.encode().unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["ids"][0], "A-1");
        assert_eq!(MemoRequest::decode(&raw).unwrap(), request);
    }

    #[test]
    fn malformed_packets_are_wire_errors() {
        let err = MemoPacket::decode("{\"id\": 7}").unwrap_err();
        assert!(matches!(err, crate::Error::Wire(_)));
    }
}
