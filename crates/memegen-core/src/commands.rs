/// The meme command set, collapsed into one dispatch table: every command
/// is the same request/response/delivery flow, differing only in endpoint
/// path, parameter kind, and output filename.

/// How a command's single parameter is turned into a query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Free text, percent-encoded before being embedded in the query.
    Text { query_param: &'static str },
    /// An image URL resolved from the invocation context.
    Image { query_param: &'static str },
}

#[derive(Debug, Clone, Copy)]
pub struct MemeCommand {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub endpoint: &'static str,
    pub param: ParamKind,
    pub filename: &'static str,
    pub help: &'static str,
}

pub const COMMANDS: &[MemeCommand] = &[
    MemeCommand {
        name: "abandon",
        aliases: &[],
        endpoint: "/abandon",
        param: ParamKind::Text { query_param: "text" },
        filename: "abandon.png",
        help: "Abandoning your son?",
    },
    MemeCommand {
        name: "abesaale",
        aliases: &[],
        endpoint: "/abesaale",
        param: ParamKind::Image { query_param: "avatar1" },
        filename: "abesaale.png",
        help: "Abe saale.",
    },
    MemeCommand {
        name: "abort",
        aliases: &["aborted"],
        endpoint: "/aborted",
        param: ParamKind::Image { query_param: "avatar1" },
        filename: "abort.png",
        help: "All the reasons why X was aborted.",
    },
    MemeCommand {
        name: "affect",
        aliases: &[],
        endpoint: "/affect",
        param: ParamKind::Image { query_param: "avatar1" },
        filename: "affect.png",
        help: "It won't affect my baby.",
    },
    MemeCommand {
        name: "brazzers",
        aliases: &[],
        endpoint: "/brazzers",
        param: ParamKind::Image { query_param: "avatar1" },
        filename: "brazzers.png",
        help: "Brazzerfy your image.",
    },
    MemeCommand {
        name: "bsdk",
        aliases: &[],
        endpoint: "/bsdk",
        param: ParamKind::Image { query_param: "avatar1" },
        filename: "bsdk.png",
        help: "Bhosdike",
    },
    MemeCommand {
        name: "kabhi",
        aliases: &[],
        endpoint: "/kabhi",
        param: ParamKind::Text { query_param: "text" },
        filename: "kabhi.png",
        help: "kabhi aisa lagta hai",
    },
    MemeCommand {
        name: "kyabe",
        aliases: &[],
        endpoint: "/kyabe",
        param: ParamKind::Image { query_param: "avatar1" },
        filename: "kyabe.png",
        help: "dissapointed pakistani guy",
    },
    MemeCommand {
        name: "kyahaal",
        aliases: &[],
        endpoint: "/kyahaal",
        param: ParamKind::Image { query_param: "avatar1" },
        filename: "kyahaal.png",
        help: "Are maa chudi padi hai",
    },
    MemeCommand {
        name: "emergencymeeting",
        aliases: &["em"],
        endpoint: "/emergencymeeting",
        param: ParamKind::Text { query_param: "text" },
        filename: "emergencymeeting.png",
        help: "Call an emergency meeting.",
    },
];

/// Look a command up by primary name or alias.
pub fn find(name: &str) -> Option<&'static MemeCommand> {
    COMMANDS
        .iter()
        .find(|c| c.name == name || c.aliases.contains(&name))
}

impl MemeCommand {
    /// Build the endpoint suffix for a normalized parameter value.
    ///
    /// Free text is percent-encoded here; image URLs are embedded as
    /// resolved (they are already well-formed URLs).
    pub fn build_suffix(&self, value: &str) -> String {
        match self.param {
            ParamKind::Text { query_param } => {
                format!("{}?{}={}", self.endpoint, query_param, urlencoding::encode(value))
            }
            ParamKind::Image { query_param } => {
                format!("{}?{}={}", self.endpoint, query_param, value)
            }
        }
    }

    pub fn takes_text(&self) -> bool {
        matches!(self.param, ParamKind::Text { .. })
    }
}
