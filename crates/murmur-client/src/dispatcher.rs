//! Inbound frame demultiplexing.
//!
//! Every transport text frame is split into its JSON lines, decoded, and
//! handed to the matching [`FrameHandler`] method synchronously and in
//! arrival order. Frames that fail to decode go to
//! [`FrameHandler::on_protocol_error`] and never stop the rest of the batch.

use murmur_shared::protocol::decode_batch;
use murmur_shared::{InboundFrame, PresenceEntry, ProtocolError, UserId, WireMessage};

pub trait FrameHandler {
    fn on_user_list(&mut self, users: Vec<PresenceEntry>);
    fn on_message(&mut self, message: WireMessage);
    fn on_history(&mut self, messages: Vec<WireMessage>);
    fn on_more_history(&mut self, messages: Vec<WireMessage>);
    fn on_typing(&mut self, sender_id: Option<UserId>, username: Option<String>);
    fn on_typing_stopped(&mut self, sender_id: Option<UserId>);
    fn on_protocol_error(&mut self, error: ProtocolError);
}

/// Decode `text` and dispatch each frame. Returns the number of frames that
/// reached a typed handler.
pub fn dispatch<H: FrameHandler + ?Sized>(text: &str, handler: &mut H) -> usize {
    let mut handled = 0;
    for result in decode_batch(text) {
        match result {
            Ok(frame) => {
                tracing::trace!(kind = frame.kind(), "Dispatching frame");
                route(frame, handler);
                handled += 1;
            }
            Err(e) => handler.on_protocol_error(e),
        }
    }
    handled
}

fn route<H: FrameHandler + ?Sized>(frame: InboundFrame, handler: &mut H) {
    match frame {
        InboundFrame::UserList { users } => handler.on_user_list(users),
        InboundFrame::Message(message) => handler.on_message(message),
        InboundFrame::History { messages } => handler.on_history(messages),
        InboundFrame::MoreHistory { messages } => handler.on_more_history(messages),
        InboundFrame::Typing {
            sender_id,
            username,
        } => handler.on_typing(sender_id, username),
        InboundFrame::TypingStopped { sender_id } => handler.on_typing_stopped(sender_id),
    }
}
