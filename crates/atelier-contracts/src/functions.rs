use indexmap::IndexMap;

use crate::errors::{CallFailure, ErrorKind};

/// The closed set of chat functions the service offers. Unknown tags never
/// reach the upstream; they fail with `UnsupportedFunction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Translate,
    Review,
    SocialPost,
    RedNotePost,
    Bargain,
    Recipe,
}

/// One system/user prompt pair for a chat-completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatInstruction {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct FunctionSpec {
    pub kind: FunctionKind,
    pub tag: &'static str,
    pub summary: &'static str,
}

/// A validated inbound function tag: `kind` or `kind:variant`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFunction {
    pub kind: FunctionKind,
    pub variant: Option<String>,
}

impl ParsedFunction {
    pub fn instruction(&self, message: &str, value: Option<&str>) -> ChatInstruction {
        let variant = self.variant.as_deref();
        let system = match self.kind {
            FunctionKind::Translate => {
                let direction = match variant {
                    Some("zh-en") => "from Chinese to English".to_string(),
                    Some("en-zh") => "from English to Chinese".to_string(),
                    Some(other) => format!("into {other}"),
                    None => "into English".to_string(),
                };
                format!(
                    "You are a professional translator. Translate the user's text {direction}. \
                     Return only the translation, nothing else."
                )
            }
            FunctionKind::Review => {
                let sentiment = match variant {
                    Some("negative") => "critical but fair",
                    Some("positive") | None => "positive",
                    Some(other) => other,
                };
                format!(
                    "You write realistic customer reviews. Write a {sentiment} review of the \
                     subject the user names. Return only the review text."
                )
            }
            FunctionKind::SocialPost => {
                let occasion = match variant {
                    Some(occasion) => format!(" The post is for {occasion}."),
                    None => String::new(),
                };
                format!(
                    "You write short, warm posts for a personal social feed.{occasion} \
                     Return only the post text."
                )
            }
            FunctionKind::RedNotePost => {
                let style = match variant {
                    Some(style) => format!(" Write it in a {style} style."),
                    None => String::new(),
                };
                format!(
                    "You write engaging lifestyle posts for a trend-sharing app: a catchy \
                     title, a lively body, and a few fitting emoji and hashtags.{style}"
                )
            }
            FunctionKind::Bargain => {
                let scenario = match variant {
                    Some(scenario) => format!(" The scenario is {scenario}."),
                    None => String::new(),
                };
                format!(
                    "You coach friendly price negotiation. Write a short, polite bargaining \
                     script for the situation the user describes.{scenario}"
                )
            }
            FunctionKind::Recipe => "You are an experienced home cook. Reply with one recipe \
                 for what the user names: an ingredient list, then numbered cooking steps."
                .to_string(),
        };

        ChatInstruction {
            system,
            user: user_content(message, value),
        }
    }
}

/// Ordered catalog of supported functions; declaration order is the order
/// they are presented to clients.
#[derive(Debug, Clone)]
pub struct FunctionCatalog {
    specs: IndexMap<&'static str, FunctionSpec>,
}

impl FunctionCatalog {
    pub fn new() -> Self {
        let mut specs = IndexMap::new();
        for spec in [
            FunctionSpec {
                kind: FunctionKind::Translate,
                tag: "translate",
                summary: "Translate text; variants: zh-en, en-zh, or a target language.",
            },
            FunctionSpec {
                kind: FunctionKind::Review,
                tag: "review",
                summary: "Write a customer review; variants: positive, negative.",
            },
            FunctionSpec {
                kind: FunctionKind::SocialPost,
                tag: "social_post",
                summary: "Write a social feed post; variant names the occasion.",
            },
            FunctionSpec {
                kind: FunctionKind::RedNotePost,
                tag: "red_note_post",
                summary: "Write a trend-sharing lifestyle post; variant names the style.",
            },
            FunctionSpec {
                kind: FunctionKind::Bargain,
                tag: "bargain",
                summary: "Write a price bargaining script; variant names the scenario.",
            },
            FunctionSpec {
                kind: FunctionKind::Recipe,
                tag: "recipe",
                summary: "Write a cooking recipe for a dish or ingredients.",
            },
        ] {
            specs.insert(spec.tag, spec);
        }
        Self { specs }
    }

    pub fn parse(&self, tag: &str) -> Result<ParsedFunction, CallFailure> {
        let trimmed = tag.trim();
        let (name, variant) = match trimmed.split_once(':') {
            Some((name, variant)) => (name.trim(), Some(variant.trim())),
            None => (trimmed, None),
        };
        let Some(spec) = self.specs.get(name) else {
            return Err(CallFailure::new(
                ErrorKind::UnsupportedFunction,
                format!("unsupported function tag '{trimmed}'"),
            ));
        };
        Ok(ParsedFunction {
            kind: spec.kind,
            variant: variant
                .filter(|variant| !variant.is_empty())
                .map(str::to_string),
        })
    }

    pub fn specs(&self) -> impl Iterator<Item = &FunctionSpec> {
        self.specs.values()
    }
}

impl Default for FunctionCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Instruction for a plain assistant reply, used when no function tag is
/// present.
pub fn default_instruction(message: &str) -> ChatInstruction {
    ChatInstruction {
        system: "You are a concise AI assistant. Reply in plain text only and keep every \
                 reply under 300 characters."
            .to_string(),
        user: message.to_string(),
    }
}

/// Instruction for the prompt optimization stage.
pub fn optimize_instruction(raw_text: &str) -> ChatInstruction {
    ChatInstruction {
        system: "You rewrite user descriptions as image generation prompts. Return only the \
                 optimized English prompt, nothing else."
            .to_string(),
        user: raw_text.to_string(),
    }
}

fn user_content(message: &str, value: Option<&str>) -> String {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => format!("{message}\n\nAdditional requirement: {value}"),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_bare_and_variant_tags() {
        let catalog = FunctionCatalog::new();

        let bare = catalog.parse("recipe").unwrap();
        assert_eq!(bare.kind, FunctionKind::Recipe);
        assert_eq!(bare.variant, None);

        let with_variant = catalog.parse("review:negative").unwrap();
        assert_eq!(with_variant.kind, FunctionKind::Review);
        assert_eq!(with_variant.variant.as_deref(), Some("negative"));

        let padded = catalog.parse("  translate : zh-en ").unwrap();
        assert_eq!(padded.kind, FunctionKind::Translate);
        assert_eq!(padded.variant.as_deref(), Some("zh-en"));
    }

    #[test]
    fn parse_rejects_unknown_tags_with_typed_error() {
        let catalog = FunctionCatalog::new();
        let failure = catalog.parse("horoscope").unwrap_err();
        assert_eq!(failure.kind, ErrorKind::UnsupportedFunction);
        assert!(failure.message.contains("horoscope"));
    }

    #[test]
    fn catalog_order_is_declaration_order() {
        let catalog = FunctionCatalog::new();
        let tags: Vec<&str> = catalog.specs().map(|spec| spec.tag).collect();
        assert_eq!(
            tags,
            vec![
                "translate",
                "review",
                "social_post",
                "red_note_post",
                "bargain",
                "recipe"
            ]
        );
    }

    #[test]
    fn translate_variant_steers_direction() {
        let catalog = FunctionCatalog::new();
        let instruction = catalog
            .parse("translate:en-zh")
            .unwrap()
            .instruction("good morning", None);
        assert!(instruction.system.contains("from English to Chinese"));
        assert_eq!(instruction.user, "good morning");

        let freeform = catalog
            .parse("translate:French")
            .unwrap()
            .instruction("good morning", None);
        assert!(freeform.system.contains("into French"));
    }

    #[test]
    fn function_value_becomes_an_extra_requirement() {
        let catalog = FunctionCatalog::new();
        let instruction = catalog
            .parse("review:positive")
            .unwrap()
            .instruction("the corner noodle shop", Some("about twenty words"));
        assert!(instruction.user.starts_with("the corner noodle shop"));
        assert!(instruction.user.contains("about twenty words"));
    }

    #[test]
    fn fixed_instructions_carry_their_contracts() {
        let optimize = optimize_instruction("a cat on a sofa");
        assert!(optimize.system.contains("nothing else"));
        assert_eq!(optimize.user, "a cat on a sofa");

        let default = default_instruction("hello");
        assert!(default.system.contains("300 characters"));
        assert_eq!(default.user, "hello");
    }
}
