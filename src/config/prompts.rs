//! Built-in prompt text

/// Built-in prompts that don't require files
pub mod builtin {
    /// System instruction sent with every direct-mode request unless overridden
    pub const SYSTEM_INSTRUCTION: &str = "You are Gemini, a friendly and helpful assistant. Answer clearly and concisely. Use Markdown for lists, tables and code.";

    /// First transcript entry of every fresh conversation
    pub const GREETING: &str = "Hello! I'm Gemini. How can I help you today?";
}
