use serde::{Deserialize, Serialize};

/// Logical model as the user selects it. Unknown identifiers read from
/// storage coerce to the default rather than failing the whole load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogicalModel {
    /// Everyday model.
    #[default]
    Flash,
    /// Highest-capability model; the escalation target for turns that
    /// carry files or URLs.
    Pro,
    /// Location-aware variant, grounded against place data.
    Atlas,
    /// Image generation.
    Sketch,
}

/// Concrete backend binding for a logical model. The tool set is a pure
/// function of the model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelProfile {
    pub backend: &'static str,
    pub tools: ToolSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSet {
    /// Web search, URL context and code execution.
    Research,
    /// Maps grounding only.
    Maps,
    None,
}

impl LogicalModel {
    pub const ALL: [LogicalModel; 4] = [
        LogicalModel::Flash,
        LogicalModel::Pro,
        LogicalModel::Atlas,
        LogicalModel::Sketch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalModel::Flash => "flash",
            LogicalModel::Pro => "pro",
            LogicalModel::Atlas => "atlas",
            LogicalModel::Sketch => "sketch",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "pro" => LogicalModel::Pro,
            "atlas" => LogicalModel::Atlas,
            "sketch" => LogicalModel::Sketch,
            _ => LogicalModel::Flash,
        }
    }

    pub fn profile(&self) -> ModelProfile {
        match self {
            LogicalModel::Flash => ModelProfile {
                backend: "gemini-2.5-flash",
                tools: ToolSet::Research,
            },
            LogicalModel::Pro => ModelProfile {
                backend: "gemini-2.5-pro",
                tools: ToolSet::Research,
            },
            // The location-aware variant always runs on the lightweight
            // backend model, regardless of escalation.
            LogicalModel::Atlas => ModelProfile {
                backend: "gemini-2.5-flash",
                tools: ToolSet::Maps,
            },
            LogicalModel::Sketch => ModelProfile {
                backend: "gemini-2.5-flash-image-preview",
                tools: ToolSet::None,
            },
        }
    }

    /// Behavior prompt attached when a session starts with neither history
    /// nor a context cache.
    pub fn system_instruction(&self) -> &'static str {
        match self {
            LogicalModel::Flash | LogicalModel::Pro => {
                "You are a capable, direct assistant. Answer in the user's \
                 language, cite web sources when you used them, prefer \
                 runnable code over prose when asked for code, and say so \
                 plainly when you do not know something."
            }
            LogicalModel::Atlas => {
                "You are a local guide. Ground every recommendation in real \
                 places, include names and addresses from the maps results \
                 you were given, and never invent locations."
            }
            LogicalModel::Sketch => {
                "Generate images that match the prompt as literally as \
                 possible. When the prompt is ambiguous, choose the most \
                 conventional reading."
            }
        }
    }
}

impl From<String> for LogicalModel {
    fn from(s: String) -> Self {
        Self::from_str_lossy(&s)
    }
}

impl From<LogicalModel> for String {
    fn from(model: LogicalModel) -> Self {
        model.as_str().to_string()
    }
}

impl std::fmt::Display for LogicalModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_identifier_coerces_to_default() {
        let model: LogicalModel = serde_json::from_str("\"gemini-9000\"").unwrap();
        assert_eq!(model, LogicalModel::Flash);
    }

    #[test]
    fn roundtrips_known_identifiers() {
        for model in LogicalModel::ALL {
            let json = serde_json::to_string(&model).unwrap();
            let back: LogicalModel = serde_json::from_str(&json).unwrap();
            assert_eq!(back, model);
        }
    }

    #[test]
    fn atlas_always_maps_to_the_lightweight_backend() {
        assert_eq!(LogicalModel::Atlas.profile().backend, "gemini-2.5-flash");
        assert_eq!(LogicalModel::Atlas.profile().tools, ToolSet::Maps);
    }
}
