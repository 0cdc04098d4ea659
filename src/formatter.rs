use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::dataset::Example;
use crate::error::{QgError, Result};

pub const HIGHLIGHT_TOKEN: &str = "<hl>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    QuestionGeneration,
    QuestionAnswering,
    AnswerExtraction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Context,
    AnswerSpan,
    Question,
}

impl Field {
    fn name(self) -> &'static str {
        match self {
            Field::Context => "context",
            Field::AnswerSpan => "answer_span",
            Field::Question => "question",
        }
    }

    fn get(self, example: &Example) -> Option<&str> {
        let value = match self {
            Field::Context => Some(example.context.as_str()),
            Field::AnswerSpan => example.answer_span.as_deref(),
            Field::Question => example.question.as_deref(),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [
        TaskType::QuestionGeneration,
        TaskType::QuestionAnswering,
        TaskType::AnswerExtraction,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            TaskType::QuestionGeneration => "generate question",
            TaskType::QuestionAnswering => "question",
            TaskType::AnswerExtraction => "extract answers",
        }
    }

    fn input_fields(self) -> &'static [Field] {
        match self {
            TaskType::QuestionGeneration => &[Field::Context, Field::AnswerSpan],
            TaskType::QuestionAnswering => &[Field::Context, Field::Question],
            TaskType::AnswerExtraction => &[Field::Context, Field::AnswerSpan],
        }
    }

    fn target_field(self) -> Field {
        match self {
            TaskType::QuestionGeneration => Field::Question,
            TaskType::QuestionAnswering | TaskType::AnswerExtraction => Field::AnswerSpan,
        }
    }

    /// True when the example carries every field a training pair needs.
    pub fn is_eligible(self, example: &Example) -> bool {
        self.input_fields()
            .iter()
            .chain(std::iter::once(&self.target_field()))
            .all(|field| field.get(example).is_some())
    }

    fn require<'a>(self, example: &'a Example, field: Field) -> Result<&'a str> {
        field.get(example).ok_or(QgError::MissingField {
            task: self,
            field: field.name(),
        })
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::QuestionGeneration => "question_generation",
            TaskType::QuestionAnswering => "question_answering",
            TaskType::AnswerExtraction => "answer_extraction",
        };
        f.write_str(name)
    }
}

/// Applies the per-task templates. Pure: no state, no randomness.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataFormatter;

impl DataFormatter {
    /// Builds the `(input_text, target_text)` training pair for `task`.
    pub fn format(&self, example: &Example, task: TaskType) -> Result<(String, String)> {
        let input = self.format_input(example, task)?;
        let target = task.require(example, task.target_field())?;
        Ok((input, target.trim().to_string()))
    }

    /// Builds only the model input, for inference where no target exists.
    pub fn format_input(&self, example: &Example, task: TaskType) -> Result<String> {
        for field in task.input_fields() {
            task.require(example, *field)?;
        }
        let context = task.require(example, Field::Context)?;

        let body = match task {
            TaskType::QuestionGeneration => {
                let answer = task.require(example, Field::AnswerSpan)?;
                highlight_phrase(context, answer.trim())?
            }
            TaskType::QuestionAnswering => {
                let question = task.require(example, Field::Question)?;
                format!("{}, context: {}", question.trim(), context)
            }
            TaskType::AnswerExtraction => {
                let answer = task.require(example, Field::AnswerSpan)?;
                let answer = answer.trim();
                let start = context.find(answer).ok_or_else(|| QgError::HighlightNotFound {
                    highlight: answer.to_string(),
                })?;
                let sentence = sentence_spans(context)
                    .into_iter()
                    .find(|span| span.start <= start && start < span.end)
                    .unwrap_or(0..context.len());
                highlight_span(context, sentence)
            }
        };

        Ok(format!("{}: {}", task.prefix(), body))
    }

    /// Answer-extraction input with the given sentence of `context` highlighted.
    pub fn answer_extraction_input(&self, context: &str, sentence: Range<usize>) -> String {
        format!(
            "{}: {}",
            TaskType::AnswerExtraction.prefix(),
            highlight_span(context, sentence)
        )
    }
}

fn highlight_phrase(text: &str, phrase: &str) -> Result<String> {
    let start = text.find(phrase).ok_or_else(|| QgError::HighlightNotFound {
        highlight: phrase.to_string(),
    })?;
    Ok(highlight_span(text, start..start + phrase.len()))
}

fn highlight_span(text: &str, span: Range<usize>) -> String {
    format!(
        "{}{hl} {} {hl}{}",
        &text[..span.start],
        &text[span.clone()],
        &text[span.end..],
        hl = HIGHLIGHT_TOKEN
    )
}

/// Byte ranges of the sentences in `text`, trimmed of surrounding whitespace.
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace or end of text.
pub fn sentence_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().map_or(true, |(_, next)| next.is_whitespace());
        if boundary {
            push_trimmed(text, start..i + c.len_utf8(), &mut spans);
            start = i + c.len_utf8();
        }
    }
    push_trimmed(text, start..text.len(), &mut spans);
    spans
}

fn push_trimmed(text: &str, span: Range<usize>, spans: &mut Vec<Range<usize>>) {
    let slice = &text[span.clone()];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    if lead + trail < slice.len() {
        spans.push(span.start + lead..span.end - trail);
    }
}
