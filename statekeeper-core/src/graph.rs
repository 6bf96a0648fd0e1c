//! Graphviz export.
//!
//! Renders a machine as a `dot` digraph. Each state is an HTML-table node
//! listing its entry and exit commands; each event and timeout is an edge.
//! Colors and line styles come from a [`Profile`].

use crate::error::CoreError;
use crate::event::Event;
use crate::machine::StateMachine;
use crate::state::State;
use serde::{Deserialize, Serialize};

/// Node attributes. Unset fields fall back to the default style.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStyle {
    pub fillcolor: Option<String>,
    pub style: Option<String>,
    pub shape: Option<String>,
    pub fontcolor: Option<String>,
    /// Color of the `onEnter:`/`onExit:` captions.
    pub table_indicator_color: Option<String>,
    /// Color of the command names.
    pub table_value_color: Option<String>,
}

impl NodeStyle {
    fn overlay(&self, over: &NodeStyle) -> NodeStyle {
        NodeStyle {
            fillcolor: over.fillcolor.clone().or_else(|| self.fillcolor.clone()),
            style: over.style.clone().or_else(|| self.style.clone()),
            shape: over.shape.clone().or_else(|| self.shape.clone()),
            fontcolor: over.fontcolor.clone().or_else(|| self.fontcolor.clone()),
            table_indicator_color: over
                .table_indicator_color
                .clone()
                .or_else(|| self.table_indicator_color.clone()),
            table_value_color: over
                .table_value_color
                .clone()
                .or_else(|| self.table_value_color.clone()),
        }
    }
}

/// Edge attributes. Unset fields fall back to the default style.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeStyle {
    pub fontcolor: Option<String>,
    pub fillcolor: Option<String>,
    pub color: Option<String>,
    pub style: Option<String>,
}

impl EdgeStyle {
    fn overlay(&self, over: &EdgeStyle) -> EdgeStyle {
        EdgeStyle {
            fontcolor: over.fontcolor.clone().or_else(|| self.fontcolor.clone()),
            fillcolor: over.fillcolor.clone().or_else(|| self.fillcolor.clone()),
            color: over.color.clone().or_else(|| self.color.clone()),
            style: over.style.clone().or_else(|| self.style.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateStyles {
    pub default: NodeStyle,
    pub initial: NodeStyle,
    #[serde(rename = "final")]
    pub final_state: NodeStyle,
    pub intermediate: NodeStyle,
}

/// Style for events whose roles are all within one role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleStyle {
    pub role: String,
    #[serde(flatten)]
    pub style: EdgeStyle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStyles {
    pub default: EdgeStyle,
    pub refresh: EdgeStyle,
    pub timeout: EdgeStyle,
    /// Checked in order; the first matching role applies.
    pub exclusive_roles: Vec<RoleStyle>,
}

/// Rendering profile. Sections left out of a profile document keep their
/// default styles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub states: StateStyles,
    pub events: EventStyles,
}

fn s(value: &str) -> Option<String> {
    Some(value.to_string())
}

impl Default for StateStyles {
    fn default() -> Self {
        Self {
            default: NodeStyle {
                fillcolor: s("#4D7E8F"),
                style: s("filled"),
                shape: s("box"),
                fontcolor: s("white"),
                table_indicator_color: s("#dddddd"),
                table_value_color: s("#F2FF00"),
            },
            initial: NodeStyle {
                fillcolor: s("#21AE1F"),
                ..Default::default()
            },
            final_state: NodeStyle {
                fillcolor: s("#A12C2C"),
                ..Default::default()
            },
            intermediate: NodeStyle {
                fillcolor: s("#F2F2F2"),
                style: s("filled, rounded, dashed"),
                shape: s("box"),
                fontcolor: s("#717171"),
                table_indicator_color: s("#777777"),
                table_value_color: s("#707200"),
            },
        }
    }
}

impl Default for EventStyles {
    fn default() -> Self {
        Self {
            default: EdgeStyle {
                fontcolor: s("black"),
                fillcolor: s("black"),
                color: s("black"),
                style: s("filled"),
            },
            refresh: EdgeStyle {
                fontcolor: s("#777777"),
                fillcolor: s("#aaaaaa"),
                color: s("#aaaaaa"),
                style: s("dashed"),
            },
            timeout: EdgeStyle {
                style: s("dashed"),
                ..Default::default()
            },
            exclusive_roles: vec![
                RoleStyle {
                    role: "system".to_string(),
                    style: EdgeStyle {
                        fontcolor: s("#BE6900"),
                        fillcolor: s("#FF8D00"),
                        color: s("#FF8D00"),
                        style: s("dashed"),
                    },
                },
                RoleStyle {
                    role: "admin".to_string(),
                    style: EdgeStyle {
                        fontcolor: s("#5087a7"),
                        fillcolor: s("#5087a7"),
                        color: s("#5087a7"),
                        style: None,
                    },
                },
            ],
        }
    }
}

impl Profile {
    fn state_style(&self, state: &State) -> NodeStyle {
        let styles = &self.states;
        if state.is_initial() {
            styles.default.overlay(&styles.initial)
        } else if state.is_final() {
            styles.default.overlay(&styles.final_state)
        } else {
            styles.default.overlay(&styles.intermediate)
        }
    }

    fn event_style(&self, event: &Event) -> EdgeStyle {
        let styles = &self.events;
        let mut style = styles.default.clone();
        if let Some(role) = styles
            .exclusive_roles
            .iter()
            .find(|r| event.is_exclusive_to(&[r.role.as_str()]))
        {
            style = style.overlay(&role.style);
        }
        if event.is_timeout() {
            style = style.overlay(&styles.timeout);
        } else if event.is_refresh() {
            style = style.overlay(&styles.refresh);
        }
        style
    }
}

/// Renders the machine as a `dot` script.
pub fn render_dot(machine: &StateMachine, profile: &Profile) -> Result<String, CoreError> {
    let states = machine.states()?;
    let mut dot = String::from("digraph G {\n  truecolor=true;\n");

    for state in &states {
        let style = profile.state_style(state);
        let label = state_label(state, &style);
        let mut attrs = vec![format!("label=<{}>", label)];
        push_attr(&mut attrs, "shape", &style.shape);
        attrs.push("margin=0.1".to_string());
        attrs.push("fontsize=10".to_string());
        attrs.push("fontname=\"Helvetica Neue\"".to_string());
        push_attr(&mut attrs, "fontcolor", &style.fontcolor);
        push_attr(&mut attrs, "fillcolor", &style.fillcolor);
        push_attr(&mut attrs, "style", &style.style);
        dot.push_str(&format!("  {} [{}];\n", quote(state.value()), attrs.join(", ")));
    }

    for state in &states {
        for event in state.events(None).iter().chain(state.timeouts()) {
            let style = profile.event_style(event);
            let mut attrs = vec![
                format!(
                    "label=<<table border=\"0\" cellspacing=\"0\" cellpadding=\"2\"><tr><td>{}</td></tr></table>>",
                    escape_html(event.label())
                ),
                "margin=10".to_string(),
                "arrowsize=0.6".to_string(),
                "fontsize=9".to_string(),
                "fontname=\"Helvetica Neue\"".to_string(),
            ];
            push_attr(&mut attrs, "fontcolor", &style.fontcolor);
            push_attr(&mut attrs, "fillcolor", &style.fillcolor);
            push_attr(&mut attrs, "color", &style.color);
            push_attr(&mut attrs, "style", &style.style);
            dot.push_str(&format!(
                "  {} -> {} [{}];\n",
                quote(state.value()),
                quote(event.target()),
                attrs.join(", ")
            ));
        }
    }

    dot.push_str("}\n");
    Ok(dot)
}

fn state_label(state: &State, style: &NodeStyle) -> String {
    let indicator = style.table_indicator_color.as_deref().unwrap_or("black");
    let value = style.table_value_color.as_deref().unwrap_or("black");

    let mut label = String::from(
        "<table cellpadding=\"0\" cellspacing=\"0\" cellborder=\"0\" border=\"0\">",
    );
    label.push_str(&format!(
        "<tr><td colspan=\"2\">{}</td></tr>",
        escape_html(state.value())
    ));
    for (caption, names) in [
        ("onEnter", state.enter_command_names()),
        ("onExit", state.exit_command_names()),
    ] {
        if names.is_empty() {
            continue;
        }
        let names: String = names
            .iter()
            .map(|n| format!("{}<br align=\"left\"/>", escape_html(n)))
            .collect();
        label.push_str(&format!(
            "<tr><td valign=\"top\" align=\"right\"><font point-size=\"8\" color=\"{}\">{}: </font></td>\
             <td align=\"left\"><font point-size=\"8\" color=\"{}\">{}</font></td></tr>",
            indicator, caption, value, names
        ));
    }
    label.push_str("</table>");
    label
}

fn push_attr(attrs: &mut Vec<String>, name: &str, value: &Option<String>) {
    if let Some(value) = value {
        attrs.push(format!("{}={}", name, quote(value)));
    }
}

fn quote(id: &str) -> String {
    format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\""))
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_machine_with;

    #[test]
    fn test_render_nodes_and_edges() {
        let machine = sample_machine_with(|b| b);
        let dot = render_dot(&machine, &Profile::default()).unwrap();

        assert!(dot.starts_with("digraph G {"));
        assert!(dot.contains("\"draft\" [label=<"));
        assert!(dot.contains("fillcolor=\"#21AE1F\""));
        assert!(dot.contains("fillcolor=\"#A12C2C\""));
        assert!(dot.contains("\"draft\" -> \"review\""));
        assert!(dot.contains("\"review\" -> \"draft\""));
        assert!(dot.contains("onEnter: "));
        assert!(dot.contains("SetAttribute<br align=\"left\"/>"));
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn test_edge_styles() {
        let machine = sample_machine_with(|b| b);
        let profile = Profile::default();
        let review = machine.state("review").unwrap();

        let approve = review.events(None)[0].clone();
        let style = profile.event_style(&approve);
        assert_eq!(style.color.as_deref(), Some("#5087a7"));
        assert_eq!(style.style.as_deref(), Some("filled"));

        let comment = review.events(None)[2].clone();
        assert_eq!(profile.event_style(&comment).color.as_deref(), Some("#aaaaaa"));

        let expire = review.timeouts()[0].clone();
        let style = profile.event_style(&expire);
        assert_eq!(style.style.as_deref(), Some("dashed"));
        assert_eq!(style.color.as_deref(), Some("black"));
    }

    #[test]
    fn test_intermediate_style_merges_default() {
        let machine = sample_machine_with(|b| b);
        let profile = Profile::default();
        let style = profile.state_style(&machine.state("review").unwrap());
        assert_eq!(style.style.as_deref(), Some("filled, rounded, dashed"));
        assert_eq!(style.fontcolor.as_deref(), Some("#717171"));
    }

    #[test]
    fn test_profile_from_yaml_overrides() {
        let profile: Profile = serde_yaml::from_str(
            "states:\n  initial:\n    fillcolor: '#000000'\nevents:\n  exclusive_roles:\n    - role: ops\n      color: red\n",
        )
        .unwrap();
        assert_eq!(profile.states.initial.fillcolor.as_deref(), Some("#000000"));
        assert_eq!(profile.events.exclusive_roles[0].style.color.as_deref(), Some("red"));
        assert_eq!(
            profile.states.default.fillcolor.as_deref(),
            Some("#4D7E8F")
        );
    }

    #[test]
    fn test_escaping() {
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
        assert_eq!(escape_html("<x & y>"), "&lt;x &amp; y&gt;");
    }
}
