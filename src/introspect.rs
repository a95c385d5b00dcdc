//! Parsing of `org.freedesktop.DBus.Introspectable.Introspect` documents.

use crate::error::{DbusError, Result};
use crate::signature;
use std::collections::BTreeMap;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArgPrototype {
    pub name: String,
    pub signature: String,
}

/// Argument lists of a method. Signals only use `out_args`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodPrototype {
    pub in_args: Vec<ArgPrototype>,
    pub out_args: Vec<ArgPrototype>,
}

pub type SignalPrototype = MethodPrototype;

impl MethodPrototype {
    pub fn in_signature(&self) -> String {
        self.in_args.iter().map(|arg| arg.signature.as_str()).collect()
    }

    pub fn out_signature(&self) -> String {
        self.out_args.iter().map(|arg| arg.signature.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    Read,
    Write,
    ReadWrite,
}

impl PropertyAccess {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "read" => Some(PropertyAccess::Read),
            "write" => Some(PropertyAccess::Write),
            "readwrite" => Some(PropertyAccess::ReadWrite),
            _ => None,
        }
    }

    pub fn is_readable(self) -> bool {
        matches!(self, PropertyAccess::Read | PropertyAccess::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, PropertyAccess::Write | PropertyAccess::ReadWrite)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyPrototype {
    pub access: PropertyAccess,
    pub signature: String,
}

/// What an object at a path says about itself, restricted to one
/// interface. All interface names and child nodes are kept.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Introspection {
    pub methods: BTreeMap<String, MethodPrototype>,
    pub signals: BTreeMap<String, SignalPrototype>,
    pub properties: BTreeMap<String, PropertyPrototype>,
    pub interfaces: Vec<String>,
    pub children: Vec<String>,
}

fn failed(path: &str, detail: impl std::fmt::Display) -> DbusError {
    DbusError::IntrospectionFailed(format!("{}: {}", path, detail))
}

impl Introspection {
    pub fn parse(xml: &str, path: &str, interface: &str) -> Result<Introspection> {
        let options = roxmltree::ParsingOptions {
            allow_dtd: true,
            ..roxmltree::ParsingOptions::default()
        };
        let document = roxmltree::Document::parse_with_options(xml, options).map_err(|err| failed(path, err))?;
        let root = document.root_element();
        let root_name = root.attribute("name").unwrap_or("");
        if root.tag_name().name() != "node" || !(root_name.is_empty() || root_name == path) {
            return Err(failed(path, "root element is not this object's node"));
        }

        let mut result = Introspection::default();
        for node in root.children().filter(|n| n.is_element()) {
            match node.tag_name().name() {
                "interface" => result.parse_interface(node, interface),
                "node" => {
                    let name = node.attribute("name").unwrap_or("");
                    if name.starts_with('/') {
                        return Err(failed(path, format!("absolute child node {:?}", name)));
                    }
                    let name = if name.is_empty() {
                        format!("child_{}", result.children.len())
                    } else {
                        name.to_string()
                    };
                    result.children.push(name);
                }
                other => trace!(tag = other, "Ignoring introspection element"),
            }
        }
        debug!(
            path,
            interface,
            methods = result.methods.len(),
            signals = result.signals.len(),
            properties = result.properties.len(),
            "Parsed introspection data"
        );
        Ok(result)
    }

    fn parse_interface(&mut self, node: roxmltree::Node<'_, '_>, interface: &str) {
        let name = node.attribute("name").unwrap_or("");
        if !self.interfaces.iter().any(|known| known == name) {
            self.interfaces.push(name.to_string());
        }
        if name != interface {
            return;
        }
        for member in node.children().filter(|n| n.is_element()) {
            match member.tag_name().name() {
                "method" => self.parse_member(member, true),
                "signal" => self.parse_member(member, false),
                "property" => self.parse_property(member),
                _ => {}
            }
        }
    }

    fn parse_member(&mut self, node: roxmltree::Node<'_, '_>, is_method: bool) {
        let name = node.attribute("name").unwrap_or("");
        if name.is_empty() {
            debug!(is_method, "Ignoring anonymous member");
            return;
        }
        let mut proto = MethodPrototype::default();
        for arg in node.children().filter(|n| n.is_element() && n.tag_name().name() == "arg") {
            let signature = arg.attribute("type").unwrap_or("");
            let direction = arg.attribute("direction").unwrap_or("");
            let is_in = direction.is_empty() || direction == "in";
            if signature.is_empty() || !(is_in || direction == "out") {
                debug!(member = name, direction, "Ignoring malformed arg");
                continue;
            }
            if !signature::validate_signature(signature, true) {
                debug!(member = name, signature, "Arg has an invalid type");
            }
            let arg = ArgPrototype {
                name: arg.attribute("name").unwrap_or("").to_string(),
                signature: signature.to_string(),
            };
            if is_method && is_in {
                proto.in_args.push(arg);
            } else {
                proto.out_args.push(arg);
            }
        }
        if is_method {
            self.methods.insert(name.to_string(), proto);
        } else {
            self.signals.insert(name.to_string(), proto);
        }
    }

    fn parse_property(&mut self, node: roxmltree::Node<'_, '_>) {
        let name = node.attribute("name").unwrap_or("");
        let signature = node.attribute("type").unwrap_or("");
        let access = node.attribute("access").and_then(PropertyAccess::parse);
        match access {
            Some(access) if !name.is_empty() && !signature.is_empty() => {
                self.properties.insert(
                    name.to_string(),
                    PropertyPrototype {
                        access,
                        signature: signature.to_string(),
                    },
                );
            }
            _ => debug!(property = name, "Ignoring malformed property"),
        }
    }
}
