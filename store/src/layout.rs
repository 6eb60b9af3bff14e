//! Where room records live in the store.

use room_core::RoomCode;

use crate::{CollectionPath, DocPath};

pub fn room(code: &RoomCode) -> DocPath {
    CollectionPath::root("rooms").doc(code.as_str())
}

/// Mesh membership, one document per client id.
pub fn participants(code: &RoomCode) -> CollectionPath {
    room(code).collection("participants")
}

pub fn signals(code: &RoomCode) -> CollectionPath {
    room(code).collection("signals")
}

/// Two-party singleton offer slot.
pub fn offer(code: &RoomCode) -> DocPath {
    signals(code).doc("offer")
}

/// Two-party singleton answer slot.
pub fn answer(code: &RoomCode) -> DocPath {
    signals(code).doc("answer")
}

pub fn candidates(code: &RoomCode) -> CollectionPath {
    room(code).collection("candidates")
}

pub fn ptt(code: &RoomCode) -> DocPath {
    room(code).collection("state").doc("ptt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_record_paths() {
        let code = RoomCode::parse("4821").unwrap();
        assert_eq!(room(&code).as_str(), "rooms/4821");
        assert_eq!(offer(&code).as_str(), "rooms/4821/signals/offer");
        assert_eq!(candidates(&code).as_str(), "rooms/4821/candidates");
        assert_eq!(ptt(&code).as_str(), "rooms/4821/state/ptt");
        assert_eq!(participants(&code).as_str(), "rooms/4821/participants");
    }
}
