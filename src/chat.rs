use std::io::{BufRead, Write};

use crate::core::{GenerationParameters, Generator};
use crate::error::Result;

const ASSISTANT_MARKER: &str = "Assistant:";

pub fn chat_generation_parameters() -> GenerationParameters {
    GenerationParameters {
        max_new_tokens: 100,
        sample: true,
        temperature: 0.7,
        top_p: 0.9,
    }
}

pub fn format_chat_prompt(history: &[(String, String)], message: &str) -> String {
    let mut prompt = String::new();
    for (user_message, assistant_message) in history {
        prompt.push_str(&format!(
            "User: {}\n{} {}\n",
            user_message, ASSISTANT_MARKER, assistant_message
        ));
    }
    prompt.push_str(&format!("User: {}\n{}", message, ASSISTANT_MARKER));
    prompt
}

/// The model may write further turns of its own; only the text after the last
/// assistant marker is the reply.
pub fn extract_reply(continuation: &str) -> String {
    match continuation.rfind(ASSISTANT_MARKER) {
        Some(position) => continuation[position + ASSISTANT_MARKER.len()..]
            .trim()
            .to_owned(),
        None => continuation.trim().to_owned(),
    }
}

pub fn run_chat<R: BufRead, W: Write>(
    generator: &mut dyn Generator,
    parameters: &GenerationParameters,
    mut input: R,
    mut output: W,
) -> Result<Vec<(String, String)>> {
    let mut history = Vec::new();
    let mut message = String::with_capacity(250);
    loop {
        write!(output, ">>> ")?;
        output.flush()?;
        message.clear();
        if input.read_line(&mut message)? == 0 {
            break;
        }
        let message = message.trim();
        if message.is_empty() {
            continue;
        }
        let prompt = format_chat_prompt(&history, message);
        let continuation = generator
            .generate(&prompt, parameters, 1)?
            .pop()
            .unwrap_or_default();
        let reply = extract_reply(&continuation);
        writeln!(output, "{}", reply)?;
        history.push((message.to_owned(), reply));
    }
    Ok(history)
}
