use crate::{
    error::{describe, PipelineError, Result, StageFault, StageResult},
    stage::Stage,
    types::{Message, Role},
};
use futures::{
    future::{self, BoxFuture},
    FutureExt,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
enum Piece {
    Text(String),
    Var(String),
}

/// A parsed `{name}` template. `{{` and `}}` are literal braces.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pieces: Vec<Piece>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        let mut pieces = Vec::new();
        let mut text = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    text.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    text.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => return Err(invalid(source, "unclosed placeholder")),
                            Some(ch) => name.push(ch),
                        }
                    }
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(invalid(source, "empty placeholder"));
                    }
                    if !text.is_empty() {
                        pieces.push(Piece::Text(std::mem::take(&mut text)));
                    }
                    pieces.push(Piece::Var(name.to_string()));
                }
                '}' => return Err(invalid(source, "unmatched '}'")),
                other => text.push(other),
            }
        }
        if !text.is_empty() {
            pieces.push(Piece::Text(text));
        }
        Ok(Self { pieces })
    }

    /// Variable names in order of first appearance.
    pub fn variables(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for piece in &self.pieces {
            if let Piece::Var(name) = piece {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Substitute variables. The error names the first missing one.
    pub fn render(&self, vars: &Map<String, Value>) -> std::result::Result<String, String> {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Var(name) => match vars.get(name) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => return Err(name.clone()),
                },
            }
        }
        Ok(out)
    }
}

fn invalid(source: &str, reason: &str) -> PipelineError {
    PipelineError::InvalidConfig(format!("template {:?}: {}", source, reason))
}

/// Prompt formatter: turns a mapping of variables into a message list.
///
/// ```
/// use llm_runnable::prompt::ChatPrompt;
///
/// let prompt = ChatPrompt::new()
///     .system("You answer questions about {topic}.")
///     .and_then(|p| p.human("{question}"))
///     .unwrap()
///     .with_partial("topic", "history");
/// assert_eq!(prompt.input_variables(), vec!["question"]);
/// ```
#[derive(Debug, Clone)]
pub struct ChatPrompt {
    name: String,
    messages: Vec<(Role, Template)>,
    partials: BTreeMap<String, Value>,
}

impl Default for ChatPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatPrompt {
    pub fn new() -> Self {
        Self {
            name: "chat_prompt".to_string(),
            messages: Vec::new(),
            partials: BTreeMap::new(),
        }
    }

    /// A prompt holding a single human message.
    pub fn from_template(template: &str) -> Result<Self> {
        Self::new().human(template)
    }

    pub fn message(mut self, role: Role, template: &str) -> Result<Self> {
        self.messages.push((role, Template::parse(template)?));
        Ok(self)
    }

    pub fn system(self, template: &str) -> Result<Self> {
        self.message(Role::System, template)
    }

    pub fn human(self, template: &str) -> Result<Self> {
        self.message(Role::Human, template)
    }

    pub fn ai(self, template: &str) -> Result<Self> {
        self.message(Role::Ai, template)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Pre-bind a variable. Input keys take precedence.
    pub fn with_partial(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.partials.insert(key.into(), value.into());
        self
    }

    /// Variables the input must supply (those without a partial).
    pub fn input_variables(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for (_, template) in &self.messages {
            for name in template.variables() {
                if !self.partials.contains_key(name) && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Render the conversation for one input.
    pub fn format(&self, input: &Value) -> StageResult<Vec<Message>> {
        let vars = self.bind(input)?;
        self.messages
            .iter()
            .map(|(role, template)| {
                template
                    .render(&vars)
                    .map(|content| Message::new(*role, content))
                    .map_err(|missing| StageFault::Input {
                        expected: format!("an object with key '{}'", missing),
                        found: describe(input),
                    })
            })
            .collect()
    }

    fn bind(&self, input: &Value) -> StageResult<Map<String, Value>> {
        let mut vars: Map<String, Value> = self
            .partials
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        match input {
            Value::Object(map) => {
                vars.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Value::Array(_) | Value::Null => {
                return Err(StageFault::input("an object of prompt variables", input));
            }
            scalar => match self.input_variables().as_slice() {
                [single] => {
                    vars.insert(single.to_string(), scalar.clone());
                }
                _ => return Err(StageFault::input("an object of prompt variables", input)),
            },
        }
        Ok(vars)
    }
}

impl Stage for ChatPrompt {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, input: Value) -> BoxFuture<'_, StageResult<Value>> {
        let result = self
            .format(&input)
            .map(|messages| Value::Array(messages.iter().map(Message::to_value).collect()));
        future::ready(result).boxed()
    }
}
