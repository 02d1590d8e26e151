//! Service name canonicalization and source-key service inference.

/// Services recognised when inferring a provider from a storage key name.
/// Longer names come first so `openrouter` wins over `openai`-style prefixes.
pub const KNOWN_SERVICES: &[&str] = &[
    "huggingface",
    "openrouter",
    "perplexity",
    "etherscan",
    "anthropic",
    "coingecko",
    "replicate",
    "sendgrid",
    "deepseek",
    "coinbase",
    "supabase",
    "firebase",
    "pinecone",
    "telegram",
    "birdeye",
    "alchemy",
    "binance",
    "discord",
    "jupiter",
    "mistral",
    "moralis",
    "twilio",
    "stripe",
    "github",
    "gemini",
    "google",
    "kraken",
    "kucoin",
    "openai",
    "helius",
    "infura",
    "cohere",
    "solana",
    "bybit",
    "slack",
    "groq",
    "aws",
    "okx",
];

/// Aliases seen in legacy data, keyed by the squashed lowercase form.
const SERVICE_ALIASES: &[(&str, &str)] = &[
    ("binanceapi", "binance"),
    ("binanceus", "binance"),
    ("openaiapi", "openai"),
    ("chatgpt", "openai"),
    ("gpt", "openai"),
    ("claude", "anthropic"),
    ("anthropicapi", "anthropic"),
    ("gh", "github"),
    ("githubtoken", "github"),
    ("hf", "huggingface"),
    ("amazon", "aws"),
    ("amazonwebservices", "aws"),
    ("googleai", "google"),
    ("googlecloud", "google"),
    ("gcp", "google"),
    ("geminiapi", "gemini"),
    ("coinbasepro", "coinbase"),
    ("krakenapi", "kraken"),
    ("heliusrpc", "helius"),
    ("tg", "telegram"),
];

pub const UNKNOWN_SERVICE: &str = "unknown";

fn squash(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Map any spelling of a service name onto its canonical form.
///
/// Unrecognised names are returned squashed (lowercase, alphanumerics only);
/// an empty result becomes `"unknown"`.
pub fn canonical_service(raw: &str) -> String {
    let squashed = squash(raw);
    if squashed.is_empty() {
        return UNKNOWN_SERVICE.to_string();
    }
    if let Some((_, canonical)) = SERVICE_ALIASES.iter().find(|(alias, _)| *alias == squashed) {
        return (*canonical).to_string();
    }
    if KNOWN_SERVICES.contains(&squashed.as_str()) {
        return squashed;
    }
    for suffix in ["api", "key", "token"] {
        if let Some(stripped) = squashed.strip_suffix(suffix) {
            if KNOWN_SERVICES.contains(&stripped) {
                return stripped.to_string();
            }
        }
    }
    squashed
}

/// Find a known service mentioned anywhere in a storage key name.
pub fn service_from_key(source_key: &str) -> Option<&'static str> {
    let lowered = source_key.to_ascii_lowercase();
    KNOWN_SERVICES
        .iter()
        .copied()
        .find(|service| lowered.contains(service))
}
