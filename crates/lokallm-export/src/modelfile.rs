//! Serving templates for runtimes that load the exported file.

use lokallm_training::ChatTemplate;
use std::fmt::Write;
use std::path::Path;

/// Ollama Modelfile pointing at `gguf_path`, with the turn delimiters the
/// adapter was trained on and the matching stop tokens.
#[must_use]
pub fn render_modelfile(gguf_path: &Path, template: ChatTemplate) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "FROM {}", gguf_path.display());
    let _ = writeln!(out, "TEMPLATE \"\"\"{}\"\"\"", template.ollama_template());
    for stop in template.stop_tokens() {
        let _ = writeln!(out, "PARAMETER stop \"{stop}\"");
    }
    out
}

/// Jinja form stored as `tokenizer.chat_template` in the file metadata.
#[must_use]
pub fn jinja_chat_template(template: ChatTemplate) -> String {
    let esc = |s: &str| s.replace('\n', "\\n");
    format!(
        "{{% for message in messages %}}\
         {{% if message['role'] == 'user' %}}{{{{ '{user}' + message['content'] + '{close}\\n' }}}}\
         {{% elif message['role'] == 'assistant' %}}{{{{ '{assistant}' + message['content'] + '{close}\\n' }}}}\
         {{% endif %}}{{% endfor %}}\
         {{% if add_generation_prompt %}}{{{{ '{assistant}' }}}}{{% endif %}}",
        user = esc(template.user_open()),
        assistant = esc(template.assistant_open()),
        close = esc(template.turn_close()),
    )
}
