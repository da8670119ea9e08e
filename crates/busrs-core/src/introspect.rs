//! Introspection data: rendering to and parsing from the standard XML.

use crate::BusError;
use std::collections::HashMap;
use std::fmt;

pub const INTROSPECT_DOCTYPE: &str = concat!(
    "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n",
    "\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n",
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgInfo {
    pub name: Option<String>,
    pub signature: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub args: Vec<ArgInfo>,
}

impl MethodInfo {
    /// Concatenated signature of the `in` arguments.
    pub fn in_signature(&self) -> String {
        self.signature_of(Direction::In)
    }

    pub fn out_signature(&self) -> String {
        self.signature_of(Direction::Out)
    }

    fn signature_of(&self, direction: Direction) -> String {
        self.args
            .iter()
            .filter(|a| a.direction == direction)
            .map(|a| a.signature.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalInfo {
    pub name: String,
    pub args: Vec<ArgInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub methods: Vec<MethodInfo>,
    pub signals: Vec<SignalInfo>,
}

/// One `<node>` element: the interfaces of an object and the names of its
/// direct children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: Option<String>,
    pub interfaces: Vec<InterfaceInfo>,
    pub children: Vec<String>,
}

impl NodeInfo {
    /// A node with no interfaces of its own, only children.
    pub fn synthetic(path: &str, children: Vec<String>) -> Self {
        Self {
            name: Some(path.to_owned()),
            interfaces: Vec::new(),
            children,
        }
    }

    pub fn to_xml(&self) -> String {
        self.to_string()
    }

    pub fn parse(xml: &str) -> Result<NodeInfo, BusError> {
        let options = roxmltree::ParsingOptions {
            allow_dtd: true,
            ..roxmltree::ParsingOptions::default()
        };
        let doc = roxmltree::Document::parse_with_options(xml, options)
            .map_err(|e| BusError::IntrospectionParse(e.to_string()))?;
        let root = doc.root_element();
        if root.tag_name().name() != "node" {
            return Err(BusError::IntrospectionParse(format!(
                "expected <node> at the top level, found <{}>",
                root.tag_name().name()
            )));
        }

        let mut node = NodeInfo {
            name: root.attribute("name").map(str::to_owned),
            ..NodeInfo::default()
        };
        for child in root.children().filter(|c| c.is_element()) {
            match child.tag_name().name() {
                "interface" => node.interfaces.push(parse_interface(&child)?),
                "node" => {
                    if let Some(name) = child.attribute("name") {
                        node.children.push(name.to_owned());
                    }
                }
                _ => {}
            }
        }
        Ok(node)
    }

    /// In-signatures of every method, keyed by `interface.member`.
    pub fn in_signatures(&self) -> HashMap<String, String> {
        self.interfaces
            .iter()
            .flat_map(|iface| {
                iface
                    .methods
                    .iter()
                    .map(move |m| (format!("{}.{}", iface.name, m.name), m.in_signature()))
            })
            .collect()
    }
}

/// Renders the introspection XML document, doctype included.
impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(INTROSPECT_DOCTYPE)?;
        match &self.name {
            Some(name) => writeln!(f, "<node name=\"{}\">", escape(name))?,
            None => f.write_str("<node>\n")?,
        }
        for iface in &self.interfaces {
            writeln!(f, "  <interface name=\"{}\">", escape(&iface.name))?;
            for method in &iface.methods {
                writeln!(f, "    <method name=\"{}\">", escape(&method.name))?;
                write_args(f, &method.args, true)?;
                f.write_str("    </method>\n")?;
            }
            for signal in &iface.signals {
                writeln!(f, "    <signal name=\"{}\">", escape(&signal.name))?;
                write_args(f, &signal.args, false)?;
                f.write_str("    </signal>\n")?;
            }
            f.write_str("  </interface>\n")?;
        }
        for child in &self.children {
            writeln!(f, "  <node name=\"{}\"/>", escape(child))?;
        }
        f.write_str("</node>\n")
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[ArgInfo], with_direction: bool) -> fmt::Result {
    for arg in args {
        f.write_str("      <arg")?;
        if let Some(name) = &arg.name {
            write!(f, " name=\"{}\"", escape(name))?;
        }
        write!(f, " type=\"{}\"", escape(&arg.signature))?;
        if with_direction {
            write!(f, " direction=\"{}\"", arg.direction.as_str())?;
        }
        f.write_str("/>\n")?;
    }
    Ok(())
}

fn required_name(node: &roxmltree::Node<'_, '_>) -> Result<String, BusError> {
    node.attribute("name").map(str::to_owned).ok_or_else(|| {
        BusError::IntrospectionParse(format!(
            "<{}> without a name attribute",
            node.tag_name().name()
        ))
    })
}

fn parse_interface(node: &roxmltree::Node<'_, '_>) -> Result<InterfaceInfo, BusError> {
    let mut iface = InterfaceInfo {
        name: required_name(node)?,
        ..InterfaceInfo::default()
    };
    for child in node.children().filter(|c| c.is_element()) {
        match child.tag_name().name() {
            "method" => iface.methods.push(MethodInfo {
                name: required_name(&child)?,
                args: parse_args(&child, Direction::In)?,
            }),
            "signal" => iface.signals.push(SignalInfo {
                name: required_name(&child)?,
                args: parse_args(&child, Direction::Out)?,
            }),
            _ => {}
        }
    }
    Ok(iface)
}

fn parse_args(
    node: &roxmltree::Node<'_, '_>,
    default_direction: Direction,
) -> Result<Vec<ArgInfo>, BusError> {
    node.children()
        .filter(|c| c.is_element() && c.tag_name().name() == "arg")
        .map(|arg| {
            let signature = arg.attribute("type").ok_or_else(|| {
                BusError::IntrospectionParse("<arg> without a type attribute".to_owned())
            })?;
            let direction = match arg.attribute("direction") {
                None => default_direction,
                Some("in") => Direction::In,
                Some("out") => Direction::Out,
                Some(other) => {
                    return Err(BusError::IntrospectionParse(format!(
                        "unknown arg direction '{other}'"
                    )))
                }
            };
            Ok(ArgInfo {
                name: arg.attribute("name").map(str::to_owned),
                signature: signature.to_owned(),
                direction,
            })
        })
        .collect()
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node name="/com/example/Calc">
  <interface name="com.example.Calc">
    <method name="Add">
      <arg name="a" type="i" direction="in"/>
      <arg name="b" type="i" direction="in"/>
      <arg name="sum" type="i" direction="out"/>
    </method>
    <method name="Reset"/>
    <signal name="Overflow">
      <arg name="at" type="x"/>
    </signal>
  </interface>
  <node name="history"/>
</node>
"#;

    #[test]
    fn parses_methods_signals_and_children() {
        let node = NodeInfo::parse(SAMPLE).unwrap();
        assert_eq!(node.name.as_deref(), Some("/com/example/Calc"));
        assert_eq!(node.children, vec!["history".to_owned()]);
        let iface = &node.interfaces[0];
        assert_eq!(iface.methods[0].in_signature(), "ii");
        assert_eq!(iface.methods[0].out_signature(), "i");
        assert_eq!(iface.methods[1].in_signature(), "");
        assert_eq!(iface.signals[0].args[0].signature, "x");

        let sigs = node.in_signatures();
        assert_eq!(sigs["com.example.Calc.Add"], "ii");
        assert_eq!(sigs["com.example.Calc.Reset"], "");
    }

    #[test]
    fn rendered_xml_parses_back() {
        let node = NodeInfo::parse(SAMPLE).unwrap();
        let xml = node.to_xml();
        assert!(xml.starts_with(INTROSPECT_DOCTYPE));
        assert_eq!(NodeInfo::parse(&xml).unwrap(), node);
    }

    #[test]
    fn synthetic_node_lists_children_only() {
        let xml = NodeInfo::synthetic("/a", vec!["b".to_owned()]).to_xml();
        assert_eq!(
            xml,
            format!("{INTROSPECT_DOCTYPE}<node name=\"/a\">\n  <node name=\"b\"/>\n</node>\n")
        );
    }

    #[test]
    fn display_renders_arguments_in_order() {
        let node = NodeInfo {
            name: None,
            interfaces: vec![InterfaceInfo {
                name: "com.example.Calc".to_owned(),
                methods: vec![MethodInfo {
                    name: "Neg".to_owned(),
                    args: vec![
                        ArgInfo {
                            name: Some("x".to_owned()),
                            signature: "i".to_owned(),
                            direction: Direction::In,
                        },
                        ArgInfo {
                            name: None,
                            signature: "i".to_owned(),
                            direction: Direction::Out,
                        },
                    ],
                }],
                signals: vec![SignalInfo {
                    name: "Done".to_owned(),
                    args: vec![ArgInfo {
                        name: None,
                        signature: "b".to_owned(),
                        direction: Direction::Out,
                    }],
                }],
            }],
            children: Vec::new(),
        };
        let expected = format!(
            "{INTROSPECT_DOCTYPE}<node>\n  <interface name=\"com.example.Calc\">\n    \
             <method name=\"Neg\">\n      <arg name=\"x\" type=\"i\" direction=\"in\"/>\n      \
             <arg type=\"i\" direction=\"out\"/>\n    </method>\n    <signal name=\"Done\">\n      \
             <arg type=\"b\"/>\n    </signal>\n  </interface>\n</node>\n"
        );
        assert_eq!(node.to_string(), expected);
        assert_eq!(node.to_xml(), expected);
    }

    #[test]
    fn attributes_are_escaped() {
        let node = NodeInfo {
            name: Some("/a\"<b>".to_owned()),
            ..NodeInfo::default()
        };
        assert!(node.to_xml().contains("name=\"/a&quot;&lt;b&gt;\""));
    }

    #[test]
    fn malformed_xml_is_an_introspection_error() {
        let err = NodeInfo::parse("<node><interface></node>").unwrap_err();
        assert!(matches!(err, BusError::IntrospectionParse(_)));
        let err = NodeInfo::parse("<notanode/>").unwrap_err();
        assert!(matches!(err, BusError::IntrospectionParse(_)));
        let err = NodeInfo::parse("<node><interface/></node>").unwrap_err();
        assert!(matches!(err, BusError::IntrospectionParse(_)));
    }
}
