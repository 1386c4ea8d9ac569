//! Workflow parameter analyzer.
//!
//! Inspects an exported workflow script (a Python file whose settings are
//! declared through `argparse` `add_argument` calls), discovers the literal
//! defaults that can be overridden, and rewrites them in place.
//!
//! Analysis is structural: the script is tokenized, every
//! `<parser>.add_argument(...)` call is parsed into flags and keyword
//! arguments, and a [`ParameterSlot`] is produced for each argument whose
//! `default=` is a literal. Substitution replaces exactly the byte span of
//! that literal, so analyzing a substituted script yields the substituted
//! values.

mod lexer;
mod parser;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::errors::AnalyzerError;
use parser::{ArgValue, ArgumentCall};

/// What a slot controls in the generated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotRole {
    Prompt,
    NegativePrompt,
    Width,
    Height,
    OutputPath,
    Seed,
    Steps,
    Other,
}

impl SlotRole {
    /// Only `prompt` may appear on several slots; `other` is not a role.
    pub fn is_unique(&self) -> bool {
        !matches!(self, SlotRole::Prompt | SlotRole::Other)
    }

    fn accepts(&self, value: &SlotValue) -> bool {
        match self {
            SlotRole::Prompt | SlotRole::NegativePrompt | SlotRole::OutputPath => {
                matches!(value, SlotValue::Text(_))
            }
            SlotRole::Width | SlotRole::Height | SlotRole::Seed | SlotRole::Steps => {
                matches!(value, SlotValue::Integer(_))
            }
            SlotRole::Other => true,
        }
    }
}

impl std::fmt::Display for SlotRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SlotRole::Prompt => "prompt",
            SlotRole::NegativePrompt => "negative_prompt",
            SlotRole::Width => "width",
            SlotRole::Height => "height",
            SlotRole::OutputPath => "output_path",
            SlotRole::Seed => "seed",
            SlotRole::Steps => "steps",
            SlotRole::Other => "other",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SlotValue {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl SlotValue {
    fn kind_name(&self) -> &'static str {
        match self {
            SlotValue::Text(_) => "text",
            SlotValue::Integer(_) => "integer",
            SlotValue::Float(_) => "float",
        }
    }

    /// Render as a literal that tokenizes back to the same value.
    fn render(&self) -> Result<String, String> {
        match self {
            SlotValue::Text(text) => {
                let mut out = String::with_capacity(text.len() + 2);
                out.push('"');
                for c in text.chars() {
                    match c {
                        '\\' => out.push_str("\\\\"),
                        '"' => out.push_str("\\\""),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\t' => out.push_str("\\t"),
                        c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
                        c => out.push(c),
                    }
                }
                out.push('"');
                Ok(out)
            }
            SlotValue::Integer(n) => Ok(n.to_string()),
            SlotValue::Float(x) if x.is_finite() => Ok(format!("{:?}", x)),
            SlotValue::Float(x) => Err(format!("{} has no literal form", x)),
        }
    }
}

impl std::fmt::Display for SlotValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotValue::Text(text) => write!(f, "{:?}", text),
            SlotValue::Integer(n) => write!(f, "{}", n),
            SlotValue::Float(x) => write!(f, "{}", x),
        }
    }
}

/// An overridable literal inside a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSlot {
    /// Argument destination, e.g. `text2`.
    pub name: String,
    pub role: SlotRole,
    /// Byte range of the literal in the definition text.
    pub span: Range<usize>,
    pub value: SlotValue,
}

/// Discover slots using name and help-text heuristics only.
pub fn analyze(text: &str) -> Result<Vec<ParameterSlot>, AnalyzerError> {
    analyze_with_roles(text, &HashMap::new())
}

/// Discover slots, forcing the role of any slot named in `overrides`.
///
/// Slots are returned in source order. A slot is omitted when its role is
/// ambiguous: name and help disagree, the literal has the wrong type for
/// the role, or a unique role is claimed by more than one slot.
pub fn analyze_with_roles(
    text: &str,
    overrides: &HashMap<String, SlotRole>,
) -> Result<Vec<ParameterSlot>, AnalyzerError> {
    let tokens = lexer::tokenize(text)?;
    let calls = parser::argument_calls(&tokens);
    if calls.is_empty() {
        return Err(AnalyzerError::UnparsableDefinition {
            offset: 0,
            reason: "no add_argument calls found".to_string(),
        });
    }

    let mut slots = Vec::new();
    for call in &calls {
        let Some(ArgValue::Literal { value, span }) = call.keyword("default") else {
            continue;
        };
        let Some(name) = call.dest() else {
            continue;
        };
        let role = match overrides.get(&name) {
            Some(role) => Some(*role),
            None => infer_role(&name, call),
        };
        let Some(role) = role else {
            tracing::debug!(slot = %name, "omitting slot with ambiguous role");
            continue;
        };
        if !role.accepts(value) {
            tracing::debug!(
                slot = %name,
                role = %role,
                kind = value.kind_name(),
                "omitting slot whose literal does not fit its role"
            );
            continue;
        }
        slots.push(ParameterSlot {
            name,
            role,
            span: span.clone(),
            value: value.clone(),
        });
    }

    let mut claims: HashMap<SlotRole, usize> = HashMap::new();
    for slot in &slots {
        *claims.entry(slot.role).or_default() += 1;
    }
    slots.retain(|slot| {
        let shared = slot.role.is_unique() && claims[&slot.role] > 1;
        if shared {
            tracing::debug!(slot = %slot.name, role = %slot.role, "omitting slot with duplicated role");
        }
        !shared
    });

    Ok(slots)
}

/// Role implied by an argument name or by the input named in its help text.
fn role_for_key(key: &str) -> Option<SlotRole> {
    let key = key
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .trim_end_matches('_')
        .to_ascii_lowercase();
    match key.as_str() {
        "text" | "prompt" | "positive" | "positive_prompt" | "text_g" | "text_l" => {
            Some(SlotRole::Prompt)
        }
        "negative" | "negative_prompt" | "neg_prompt" => Some(SlotRole::NegativePrompt),
        "width" => Some(SlotRole::Width),
        "height" => Some(SlotRole::Height),
        "seed" | "noise_seed" => Some(SlotRole::Seed),
        "steps" => Some(SlotRole::Steps),
        "output" | "output_path" | "output_file" | "out" => Some(SlotRole::OutputPath),
        _ => None,
    }
}

/// Exported workflows describe each argument as ``input `name` for node "Title"``.
fn help_input_name(help: &str) -> Option<&str> {
    let rest = &help[help.find("input `")? + "input `".len()..];
    Some(&rest[..rest.find('`')?])
}

/// `None` means the name and help text point at different roles.
fn infer_role(name: &str, call: &ArgumentCall) -> Option<SlotRole> {
    let help = call.help().unwrap_or_default();
    let by_name = role_for_key(name);
    let by_help = help_input_name(help).and_then(role_for_key);
    let role = match (by_name, by_help) {
        (Some(a), Some(b)) if a != b => return None,
        (Some(role), _) | (None, Some(role)) => role,
        (None, None) => SlotRole::Other,
    };
    if role == SlotRole::Prompt && help.to_ascii_lowercase().contains("negative") {
        return Some(SlotRole::NegativePrompt);
    }
    Some(role)
}

/// Rewrite slot literals with new values.
///
/// Each replacement must have the same value kind as the slot it targets,
/// and slot spans must not overlap.
pub fn substitute(
    text: &str,
    replacements: &[(ParameterSlot, SlotValue)],
) -> Result<String, AnalyzerError> {
    let mut edits: Vec<(Range<usize>, String, &str)> = Vec::with_capacity(replacements.len());
    for (slot, value) in replacements {
        let invalid = |reason: String| AnalyzerError::InvalidSubstitution {
            slot: slot.name.clone(),
            reason,
        };
        if std::mem::discriminant(&slot.value) != std::mem::discriminant(value) {
            return Err(invalid(format!(
                "expected {} value, got {}",
                slot.value.kind_name(),
                value.kind_name()
            )));
        }
        let span = slot.span.clone();
        if span.start > span.end
            || span.end > text.len()
            || !text.is_char_boundary(span.start)
            || !text.is_char_boundary(span.end)
        {
            return Err(invalid("span lies outside the definition".to_string()));
        }
        let rendered = value.render().map_err(invalid)?;
        edits.push((span, rendered, slot.name.as_str()));
    }

    edits.sort_by_key(|(span, _, _)| span.start);
    for pair in edits.windows(2) {
        if pair[0].0.end > pair[1].0.start {
            return Err(AnalyzerError::InvalidSubstitution {
                slot: pair[1].2.to_string(),
                reason: format!("overlaps slot '{}'", pair[0].2),
            });
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (span, rendered, _) in &edits {
        out.push_str(&text[cursor..span.start]);
        out.push_str(rendered);
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}

/// A loaded workflow script together with its discovered slots.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub path: PathBuf,
    pub text: String,
    pub slots: Vec<ParameterSlot>,
}

impl WorkflowDefinition {
    pub fn parse(
        path: impl Into<PathBuf>,
        text: String,
        overrides: &HashMap<String, SlotRole>,
    ) -> Result<Self, AnalyzerError> {
        let slots = analyze_with_roles(&text, overrides)?;
        Ok(Self {
            path: path.into(),
            text,
            slots,
        })
    }

    pub fn slots_with_role(&self, role: SlotRole) -> impl Iterator<Item = &ParameterSlot> {
        self.slots.iter().filter(move |s| s.role == role)
    }

    /// Script text with the given role values applied. A value is applied
    /// to every slot carrying its role.
    pub fn render(&self, values: &[(SlotRole, SlotValue)]) -> Result<String, AnalyzerError> {
        let replacements: Vec<(ParameterSlot, SlotValue)> = values
            .iter()
            .flat_map(|(role, value)| {
                self.slots_with_role(*role)
                    .map(move |slot| (slot.clone(), value.clone()))
            })
            .collect();
        substitute(&self.text, &replacements)
    }
}

/// Saved analysis of a workflow, editable by hand to correct roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotMapping {
    pub script: PathBuf,
    pub analyzed_at: DateTime<Utc>,
    pub slots: Vec<ParameterSlot>,
}

impl SlotMapping {
    pub fn new(script: impl Into<PathBuf>, slots: Vec<ParameterSlot>) -> Self {
        Self {
            script: script.into(),
            analyzed_at: Utc::now(),
            slots,
        }
    }

    /// Where the mapping for `script` lives under `mappings_dir`.
    pub fn path_for(mappings_dir: &Path, script: &Path) -> PathBuf {
        let stem = script
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workflow".to_string());
        mappings_dir.join(format!("{}.json", stem))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read slot mapping: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse slot mapping: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize slot mapping")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write slot mapping: {}", path.display()))
    }

    /// Roles recorded in the mapping, keyed by slot name.
    pub fn role_overrides(&self) -> HashMap<String, SlotRole> {
        self.slots
            .iter()
            .map(|slot| (slot.name.clone(), slot.role))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORTED: &str = r#"
import argparse

parser = argparse.ArgumentParser(description="A converted ComfyUI workflow.")
parser.add_argument(
    "--text2",
    default="A neon city at dusk, synthwave poster",
    help='Argument 0, input `text` for node "CLIP Text Encode (Positive Prompt)" id 6 (autogenerated)',
)

parser.add_argument(
    "--width3",
    default=1024,
    help='Argument 0, input `width` for node "EmptySD3LatentImage" id 27 (autogenerated)',
)

parser.add_argument(
    "--height4",
    default=1024,
    help='Argument 1, input `height` for node "EmptySD3LatentImage" id 27 (autogenerated)',
)

parser.add_argument(
    "--text6",
    default="",
    help='Argument 0, input `text` for node "CLIP Text Encode (Negative Prompt)" id 33 (autogenerated)',
)

parser.add_argument(
    "--guidance9",
    default=3.5,
    help='Argument 1, input `guidance` for node "FluxGuidance" id 35 (autogenerated)',
)

parser.add_argument(
    "--seed10",
    default=506110383474831,
    help='Argument 1, input `seed` for node "KSampler" id 31 (autogenerated)',
)

parser.add_argument(
    "--steps11",
    default=20,
    help='Argument 2, input `steps` for node "KSampler" id 31 (autogenerated)',
)

parser.add_argument(
    "--output",
    "-o",
    default=None,
    help="The location to save the output image.",
)

args = parser.parse_args()
print(f"saved to {args.output}")
"#;

    fn role_of(slots: &[ParameterSlot], name: &str) -> Option<SlotRole> {
        slots.iter().find(|s| s.name == name).map(|s| s.role)
    }

    #[test]
    fn test_discovers_roles_from_exported_workflow() {
        let slots = analyze(EXPORTED).unwrap();
        assert_eq!(role_of(&slots, "text2"), Some(SlotRole::Prompt));
        assert_eq!(role_of(&slots, "text6"), Some(SlotRole::NegativePrompt));
        assert_eq!(role_of(&slots, "width3"), Some(SlotRole::Width));
        assert_eq!(role_of(&slots, "height4"), Some(SlotRole::Height));
        assert_eq!(role_of(&slots, "seed10"), Some(SlotRole::Seed));
        assert_eq!(role_of(&slots, "steps11"), Some(SlotRole::Steps));
        assert_eq!(role_of(&slots, "guidance9"), Some(SlotRole::Other));
        // default=None is not a literal
        assert_eq!(role_of(&slots, "output"), None);
    }

    #[test]
    fn test_slots_are_in_source_order_with_exact_spans() {
        let slots = analyze(EXPORTED).unwrap();
        let names: Vec<&str> = slots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["text2", "width3", "height4", "text6", "guidance9", "seed10", "steps11"]
        );
        let width = slots.iter().find(|s| s.name == "width3").unwrap();
        assert_eq!(&EXPORTED[width.span.clone()], "1024");
        assert_eq!(width.value, SlotValue::Integer(1024));
    }

    #[test]
    fn test_substitute_round_trips_values() {
        let slots = analyze(EXPORTED).unwrap();
        let find = |name: &str| slots.iter().find(|s| s.name == name).unwrap().clone();
        let prompt = "Retro \"sunset\" tee\nwith a back\\slash and a tab\t";
        let rewritten = substitute(
            EXPORTED,
            &[
                (find("text2"), SlotValue::Text(prompt.into())),
                (find("width3"), SlotValue::Integer(768)),
                (find("seed10"), SlotValue::Integer(-42)),
                (find("guidance9"), SlotValue::Float(1e-3)),
            ],
        )
        .unwrap();

        let again = analyze(&rewritten).unwrap();
        let value = |name: &str| again.iter().find(|s| s.name == name).unwrap().value.clone();
        assert_eq!(value("text2"), SlotValue::Text(prompt.into()));
        assert_eq!(value("width3"), SlotValue::Integer(768));
        assert_eq!(value("seed10"), SlotValue::Integer(-42));
        assert_eq!(value("guidance9"), SlotValue::Float(1e-3));
        // untouched slots keep their values
        assert_eq!(value("height4"), SlotValue::Integer(1024));
        assert_eq!(again.len(), slots.len());
    }

    #[test]
    fn test_substitute_round_trips_numeric_extremes() {
        let slots = analyze(EXPORTED).unwrap();
        let find = |name: &str| slots.iter().find(|s| s.name == name).unwrap().clone();

        for n in [i64::MIN, i64::MAX, 0] {
            let rewritten =
                substitute(EXPORTED, &[(find("seed10"), SlotValue::Integer(n))]).unwrap();
            let again = analyze(&rewritten).unwrap();
            let seed = again.iter().find(|s| s.name == "seed10");
            assert_eq!(seed.map(|s| &s.value), Some(&SlotValue::Integer(n)), "{n}");
        }

        for x in [-0.0f64, 1e300, 5e-324] {
            let rewritten =
                substitute(EXPORTED, &[(find("guidance9"), SlotValue::Float(x))]).unwrap();
            let again = analyze(&rewritten).unwrap();
            match again.iter().find(|s| s.name == "guidance9").map(|s| &s.value) {
                Some(SlotValue::Float(y)) => assert_eq!(y.to_bits(), x.to_bits(), "{x:?}"),
                other => panic!("Expected float for {x:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_substitute_rejects_kind_mismatch() {
        let slots = analyze(EXPORTED).unwrap();
        let width = slots.iter().find(|s| s.name == "width3").unwrap().clone();
        let err = substitute(EXPORTED, &[(width, SlotValue::Text("wide".into()))]).unwrap_err();
        assert!(matches!(err, AnalyzerError::InvalidSubstitution { ref slot, .. } if slot == "width3"));
    }

    #[test]
    fn test_substitute_rejects_overlapping_slots() {
        let slots = analyze(EXPORTED).unwrap();
        let width = slots.iter().find(|s| s.name == "width3").unwrap().clone();
        let err = substitute(
            EXPORTED,
            &[
                (width.clone(), SlotValue::Integer(1)),
                (width, SlotValue::Integer(2)),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, AnalyzerError::InvalidSubstitution { .. }));
    }

    #[test]
    fn test_duplicate_unique_role_is_omitted() {
        let src = r#"
p.add_argument("--width", default=512)
p.add_argument("--w2", default=640, help='input `width` for node "Upscale"')
p.add_argument("--prompt", default="a")
p.add_argument("--text_g", default="b")
"#;
        let slots = analyze(src).unwrap();
        assert_eq!(role_of(&slots, "width"), None);
        assert_eq!(role_of(&slots, "w2"), None);
        // prompt is multi-valued
        assert_eq!(role_of(&slots, "prompt"), Some(SlotRole::Prompt));
        assert_eq!(role_of(&slots, "text_g"), Some(SlotRole::Prompt));
    }

    #[test]
    fn test_conflicting_name_and_help_is_omitted() {
        let src = r#"p.add_argument("--width", default=512, help='input `height` for node "X"')"#;
        assert!(analyze(src).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_literal_type_is_omitted() {
        let src = r#"p.add_argument("--width", default="512")"#;
        assert!(analyze(src).unwrap().is_empty());
    }

    #[test]
    fn test_overrides_force_roles() {
        let src = r#"
p.add_argument("--caption", default="hello")
p.add_argument("--size_x", default=512)
"#;
        let mut overrides = HashMap::new();
        overrides.insert("caption".to_string(), SlotRole::Prompt);
        overrides.insert("size_x".to_string(), SlotRole::Width);
        let slots = analyze_with_roles(src, &overrides).unwrap();
        assert_eq!(role_of(&slots, "caption"), Some(SlotRole::Prompt));
        assert_eq!(role_of(&slots, "size_x"), Some(SlotRole::Width));
    }

    #[test]
    fn test_unparsable_definitions() {
        assert!(matches!(
            analyze("print('hello')"),
            Err(AnalyzerError::UnparsableDefinition { .. })
        ));
        assert!(matches!(
            analyze("parser.add_argument(\"--text\", default=\"oops)\n"),
            Err(AnalyzerError::UnparsableDefinition { .. })
        ));
        assert!(matches!(
            analyze("parser.add_argument(\"--width\", default=1"),
            Err(AnalyzerError::UnparsableDefinition { .. })
        ));
    }

    #[test]
    fn test_definition_render_applies_role_values() {
        let definition =
            WorkflowDefinition::parse("wf.py", EXPORTED.to_string(), &HashMap::new()).unwrap();
        let rendered = definition
            .render(&[
                (SlotRole::Prompt, SlotValue::Text("cosmic cat".into())),
                (SlotRole::Height, SlotValue::Integer(1280)),
            ])
            .unwrap();
        let slots = analyze(&rendered).unwrap();
        assert_eq!(
            slots.iter().find(|s| s.role == SlotRole::Prompt).unwrap().value,
            SlotValue::Text("cosmic cat".into())
        );
        assert_eq!(
            slots.iter().find(|s| s.role == SlotRole::Height).unwrap().value,
            SlotValue::Integer(1280)
        );
    }

    #[test]
    fn test_slot_mapping_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let slots = analyze(EXPORTED).unwrap();
        let path = SlotMapping::path_for(dir.path(), Path::new("/wf/flux_poster.py"));
        assert!(path.ends_with("flux_poster.json"));

        SlotMapping::new("/wf/flux_poster.py", slots.clone())
            .save(&path)
            .unwrap();
        let loaded = SlotMapping::load(&path).unwrap();
        assert_eq!(loaded.slots, slots);
        assert_eq!(
            loaded.role_overrides().get("text6"),
            Some(&SlotRole::NegativePrompt)
        );
    }
}
