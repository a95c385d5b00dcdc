//! Message construction and header access on top of zbus.
//!
//! zbus owns the wire format: framing, header fields, serial allocation
//! and body encoding. This module only adds the well-known bus names and
//! a flattened view of the header the proxy layer reads.

use crate::error::Result;
use std::num::NonZeroU32;
use zbus::message::Flags;

pub use zbus::message::{Builder, Type as MessageType};
pub use zbus::Message;

pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

pub const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
pub const ERROR_DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
pub const ERROR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";

/// Start a method call on `interface.member` at `destination`/`path`.
pub fn method_call<'a>(destination: &'a str, path: &'a str, interface: &'a str, member: &'a str) -> Result<Builder<'a>> {
    Ok(Message::method(path, member)?
        .destination(destination)?
        .interface(interface)?)
}

/// Like [`method_call`], for calls whose reply nobody waits for.
pub fn method_call_no_reply<'a>(
    destination: &'a str,
    path: &'a str,
    interface: &'a str,
    member: &'a str,
) -> Result<Builder<'a>> {
    Ok(method_call(destination, path, interface, member)?.with_flags(Flags::NoReplyExpected)?)
}

/// Header fields of a received message, copied out of zbus' borrowed
/// header types.
pub trait MessageExt {
    fn serial_number(&self) -> u32;
    fn reply_to(&self) -> Option<u32>;
    fn member_name(&self) -> Option<String>;
    fn path_name(&self) -> Option<String>;
    fn interface_name(&self) -> Option<String>;
    fn sender_name(&self) -> Option<String>;
    fn error_name_str(&self) -> Option<String>;
    /// Signature of the whole body, empty when there is none.
    fn body_signature(&self) -> String;
    /// First string argument of an error reply.
    fn error_text(&self) -> Option<String>;
    fn expects_reply(&self) -> bool;

    fn is_reply(&self) -> bool;
    fn is_signal(&self, interface: &str, member: &str) -> bool;
}

impl MessageExt for Message {
    fn serial_number(&self) -> u32 {
        self.primary_header().serial_num().get()
    }

    fn reply_to(&self) -> Option<u32> {
        self.header().reply_serial().map(NonZeroU32::get)
    }

    fn member_name(&self) -> Option<String> {
        self.header().member().map(|member| member.as_str().to_owned())
    }

    fn path_name(&self) -> Option<String> {
        self.header().path().map(|path| path.as_str().to_owned())
    }

    fn interface_name(&self) -> Option<String> {
        self.header().interface().map(|interface| interface.as_str().to_owned())
    }

    fn sender_name(&self) -> Option<String> {
        self.header().sender().map(|sender| sender.as_str().to_owned())
    }

    fn error_name_str(&self) -> Option<String> {
        self.header().error_name().map(|name| name.as_str().to_owned())
    }

    fn body_signature(&self) -> String {
        self.header()
            .signature()
            .map(|signature| signature.as_str().to_owned())
            .unwrap_or_default()
    }

    fn error_text(&self) -> Option<String> {
        if !self.body_signature().starts_with('s') {
            return None;
        }
        self.body().deserialize::<String>().ok()
    }

    fn expects_reply(&self) -> bool {
        !self.primary_header().flags().contains(Flags::NoReplyExpected)
    }

    fn is_reply(&self) -> bool {
        matches!(self.message_type(), MessageType::MethodReturn | MessageType::Error)
    }

    fn is_signal(&self, interface: &str, member: &str) -> bool {
        self.message_type() == MessageType::Signal
            && self.interface_name().as_deref() == Some(interface)
            && self.member_name().as_deref() == Some(member)
    }
}
