//! LLM provider catalog and per-vendor wire adapters.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod shared;

use anyhow::{Result, bail};

pub use shared::{
    GenerationRequest, HttpRequest, Part, ProviderError, ProviderErrorKind, ProviderResult,
    StreamEvent, Turn, classify_reqwest_error, resolve_api_key, resolve_base_url,
};

/// Supported vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Gemini,
    OpenAI,
    OpenRouter,
    Anthropic,
}

/// How a provider expects the API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `x-goog-api-key: <key>`
    GoogApiKey,
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `x-api-key: <key>` plus `anthropic-version`
    XApiKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Model {
    pub name: &'static str,
    pub supports_vision: bool,
}

/// Static provider descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Provider {
    pub kind: ProviderKind,
    pub key: &'static str,
    pub label: &'static str,
    pub api_host: &'static str,
    pub auth_style: AuthStyle,
    pub models: &'static [Model],
}

impl Provider {
    pub fn model(&self, name: &str) -> Option<&'static Model> {
        self.models.iter().find(|model| model.name == name)
    }

    pub fn default_model(&self) -> &'static Model {
        &self.models[0]
    }
}

const GEMINI_MODELS: &[Model] = &[
    Model {
        name: "gemini-2.5-flash",
        supports_vision: true,
    },
    Model {
        name: "gemini-2.5-pro",
        supports_vision: true,
    },
    Model {
        name: "gemini-2.5-flash-lite",
        supports_vision: true,
    },
];

const OPENAI_MODELS: &[Model] = &[
    Model {
        name: "gpt-4o-mini",
        supports_vision: true,
    },
    Model {
        name: "gpt-4o",
        supports_vision: true,
    },
    Model {
        name: "gpt-3.5-turbo",
        supports_vision: false,
    },
];

const OPENROUTER_MODELS: &[Model] = &[
    Model {
        name: "openai/gpt-4o-mini",
        supports_vision: true,
    },
    Model {
        name: "meta-llama/llama-3.3-70b-instruct",
        supports_vision: false,
    },
    Model {
        name: "deepseek/deepseek-chat",
        supports_vision: false,
    },
];

const ANTHROPIC_MODELS: &[Model] = &[
    Model {
        name: "claude-sonnet-4-5",
        supports_vision: true,
    },
    Model {
        name: "claude-haiku-4-5",
        supports_vision: true,
    },
];

static CATALOG: [Provider; 4] = [
    Provider {
        kind: ProviderKind::Gemini,
        key: "gemini",
        label: "Gemini",
        api_host: gemini::DEFAULT_BASE_URL,
        auth_style: AuthStyle::GoogApiKey,
        models: GEMINI_MODELS,
    },
    Provider {
        kind: ProviderKind::OpenAI,
        key: "openai",
        label: "OpenAI",
        api_host: openai::DEFAULT_BASE_URL,
        auth_style: AuthStyle::Bearer,
        models: OPENAI_MODELS,
    },
    Provider {
        kind: ProviderKind::OpenRouter,
        key: "openrouter",
        label: "OpenRouter",
        api_host: openai::OPENROUTER_BASE_URL,
        auth_style: AuthStyle::Bearer,
        models: OPENROUTER_MODELS,
    },
    Provider {
        kind: ProviderKind::Anthropic,
        key: "anthropic",
        label: "Anthropic",
        api_host: anthropic::DEFAULT_BASE_URL,
        auth_style: AuthStyle::XApiKey,
        models: ANTHROPIC_MODELS,
    },
];

/// Returns the full provider catalog.
pub fn catalog() -> &'static [Provider] {
    &CATALOG
}

impl ProviderKind {
    /// Returns all provider kinds.
    pub fn all() -> &'static [ProviderKind] {
        &[
            ProviderKind::Gemini,
            ProviderKind::OpenAI,
            ProviderKind::OpenRouter,
            ProviderKind::Anthropic,
        ]
    }

    /// Returns the string identifier used in config files.
    pub fn id(&self) -> &'static str {
        self.provider().key
    }

    /// Returns the `ProviderKind` for a given id string.
    pub fn from_id(id: &str) -> Option<ProviderKind> {
        match id.trim().to_lowercase().as_str() {
            "gemini" | "google" => Some(ProviderKind::Gemini),
            "openai" => Some(ProviderKind::OpenAI),
            "openrouter" => Some(ProviderKind::OpenRouter),
            "anthropic" | "claude" => Some(ProviderKind::Anthropic),
            _ => None,
        }
    }

    /// Like [`ProviderKind::from_id`], with an error listing valid ids.
    ///
    /// # Errors
    /// Returns an error for unknown provider ids.
    pub fn parse(id: &str) -> Result<ProviderKind> {
        match Self::from_id(id) {
            Some(kind) => Ok(kind),
            None => {
                let known: Vec<&str> = Self::all().iter().map(ProviderKind::id).collect();
                bail!("Unknown provider '{id}' (expected one of: {})", known.join(", "))
            }
        }
    }

    /// Returns the human-readable label for display.
    pub fn label(&self) -> &'static str {
        self.provider().label
    }

    pub fn provider(&self) -> &'static Provider {
        match self {
            ProviderKind::Gemini => &CATALOG[0],
            ProviderKind::OpenAI => &CATALOG[1],
            ProviderKind::OpenRouter => &CATALOG[2],
            ProviderKind::Anthropic => &CATALOG[3],
        }
    }

    pub fn api_key_env_var(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "GEMINI_API_KEY",
            ProviderKind::OpenAI => "OPENAI_API_KEY",
            ProviderKind::OpenRouter => "OPENROUTER_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    pub fn base_url_env_var(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "GEMINI_BASE_URL",
            ProviderKind::OpenAI => "OPENAI_BASE_URL",
            ProviderKind::OpenRouter => "OPENROUTER_BASE_URL",
            ProviderKind::Anthropic => "ANTHROPIC_BASE_URL",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        self.provider().api_host
    }

    pub fn adapter(&self) -> Adapter {
        match self {
            ProviderKind::Gemini => Adapter::Gemini,
            ProviderKind::OpenAI | ProviderKind::OpenRouter => Adapter::OpenAiCompatible,
            ProviderKind::Anthropic => Adapter::Anthropic,
        }
    }

    /// Resolves the base URL for this provider (env > config > default).
    ///
    /// # Errors
    /// Returns an error if an override is not a valid URL.
    pub fn resolve_base_url(&self, config_base_url: Option<&str>) -> Result<String> {
        resolve_base_url(
            config_base_url,
            self.base_url_env_var(),
            self.default_base_url(),
            self.label(),
        )
    }
}

/// What a vendor's request shape can express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub system_as_first_turn: bool,
    pub system_as_separate_field: bool,
    pub supports_tools_field: bool,
}

/// Where and how to reach a vendor for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
}

/// Per-vendor wire translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    /// Turn-based history with `contents` / `parts`.
    Gemini,
    /// Flat `messages`, system prompt as a leading message.
    OpenAiCompatible,
    /// Flat `messages`, system prompt as a separate field.
    Anthropic,
}

impl Adapter {
    pub fn capabilities(self) -> Capabilities {
        match self {
            Adapter::Gemini => Capabilities {
                system_as_first_turn: true,
                system_as_separate_field: false,
                supports_tools_field: true,
            },
            Adapter::OpenAiCompatible => Capabilities {
                system_as_first_turn: true,
                system_as_separate_field: false,
                supports_tools_field: false,
            },
            Adapter::Anthropic => Capabilities {
                system_as_first_turn: false,
                system_as_separate_field: true,
                supports_tools_field: false,
            },
        }
    }

    /// Translates a canonical request into the vendor's streaming request.
    ///
    /// # Errors
    /// Returns `InvalidRequest` when the key cannot be sent as a header.
    pub fn build_request(
        self,
        request: &GenerationRequest,
        endpoint: &Endpoint,
    ) -> ProviderResult<HttpRequest> {
        match self {
            Adapter::Gemini => gemini::build_request(request, endpoint),
            Adapter::OpenAiCompatible => openai::build_request(request, endpoint),
            Adapter::Anthropic => anthropic::build_request(request, endpoint),
        }
    }

    /// Decodes the payload of one `data:` line.
    ///
    /// # Errors
    /// Returns a `Parse` error for malformed frames.
    pub fn parse_frame(self, data: &str) -> ProviderResult<StreamEvent> {
        match self {
            Adapter::Gemini => gemini::parse_frame(data),
            Adapter::OpenAiCompatible => openai::parse_frame(data),
            Adapter::Anthropic => anthropic::parse_frame(data),
        }
    }

    /// Literal payload that ends the stream, if the vendor sends one.
    ///
    /// Gemini ends at end-of-stream; Anthropic's terminal is a
    /// `message_stop` frame decoded by [`Adapter::parse_frame`].
    pub fn done_marker(self) -> Option<&'static str> {
        match self {
            Adapter::OpenAiCompatible => Some(openai::DONE_MARKER),
            Adapter::Gemini | Adapter::Anthropic => None,
        }
    }

    /// Builds a lightweight request that succeeds only for a usable key.
    ///
    /// # Errors
    /// Returns `InvalidRequest` when the key cannot be sent as a header.
    pub fn probe_request(
        self,
        base_url: &str,
        model: &str,
        api_key: &str,
    ) -> ProviderResult<HttpRequest> {
        match self {
            Adapter::Gemini => gemini::probe_request(base_url, api_key),
            Adapter::OpenAiCompatible => openai::probe_request(base_url, api_key),
            Adapter::Anthropic => anthropic::probe_request(base_url, model, api_key),
        }
    }
}
