//! Conversions between gateway types and wire frames.

use bytes::Bytes;
use courier_core::{ClientInfo, Disconnect, Error, PresenceEntry, Publication, Push, StreamPosition};
use courier_protocol::{ClientDetails, Frame, Position, PresenceData, PublicationData};

/// Connection info blobs are JSON on the wire; anything else is dropped.
fn info_json(info: Option<&Bytes>) -> Option<serde_json::Value> {
    info.and_then(|b| serde_json::from_slice(b).ok())
}

pub fn client_details(info: ClientInfo) -> ClientDetails {
    ClientDetails {
        info: info_json(info.conn_info.as_ref()),
        user: info.user_id,
        client: info.client_id,
    }
}

pub fn publication_data(publication: Publication) -> PublicationData {
    PublicationData {
        offset: publication.offset,
        timestamp: publication.timestamp,
        payload: publication.payload.to_vec(),
        info: publication.info.map(client_details),
    }
}

pub fn presence_data(entry: PresenceEntry) -> PresenceData {
    PresenceData {
        info: info_json(entry.conn_info.as_ref()),
        client: entry.client_id,
        user: entry.user_id,
        joined_at: entry.joined_at,
    }
}

pub fn position(position: StreamPosition) -> Position {
    Position {
        offset: position.offset,
        epoch: position.epoch,
    }
}

pub fn stream_position(position: Position) -> StreamPosition {
    StreamPosition {
        offset: position.offset,
        epoch: position.epoch,
    }
}

pub fn disconnect_frame(disconnect: Disconnect) -> Frame {
    Frame::Disconnect {
        code: disconnect.code,
        reason: disconnect.reason.to_string(),
        reconnect: disconnect.reconnect,
    }
}

pub fn error_frame(id: u64, error: &Error) -> Frame {
    Frame::error(id, error.code(), error.to_string())
}

/// Frame delivering a push to the client.
pub fn push_frame(push: Push) -> Frame {
    match push {
        Push::Publication(publication) => Frame::Publication {
            channel: publication.channel.clone(),
            publication: publication_data(publication),
        },
        Push::Join { channel, info } => Frame::Join {
            channel,
            info: client_details(info),
        },
        Push::Leave { channel, info } => Frame::Leave {
            channel,
            info: client_details(info),
        },
        Push::Disconnect(disconnect) => disconnect_frame(disconnect),
    }
}
