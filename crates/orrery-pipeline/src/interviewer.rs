//! Human interaction: questions, answers, and interviewer implementations.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use orrery_types::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionKind {
    YesNo,
    MultipleChoice,
    FreeForm,
    Confirmation,
}

#[derive(Debug, Clone)]
pub struct QuestionOption {
    /// Accelerator key advertised in the label (e.g. `A` for `[A] Approve`).
    pub key: String,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct Question {
    pub text: String,
    pub kind: QuestionKind,
    pub options: Vec<QuestionOption>,
    pub default: Option<String>,
    pub timeout: Option<Duration>,
    /// The node id this question belongs to.
    pub stage: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Yes,
    No,
    /// A selected option key or label.
    Choice(String),
    /// Free-form text.
    Text(String),
    Skipped,
    Timeout,
}

impl Answer {
    /// The comparable string form of the answer, empty for the sentinel
    /// variants.
    pub fn as_text(&self) -> &str {
        match self {
            Answer::Choice(s) | Answer::Text(s) => s,
            Answer::Yes => "yes",
            Answer::No => "no",
            Answer::Skipped | Answer::Timeout => "",
        }
    }
}

/// A polymorphic capability for asking a human questions mid-run.
#[async_trait]
pub trait Interviewer: Send + Sync {
    async fn ask(&self, question: &Question) -> Result<Answer>;

    /// One-way notification; the default discards it.
    fn inform(&self, _message: &str, _stage: &str) {}
}

// ---------------------------------------------------------------------------
// AutoApproveInterviewer
// ---------------------------------------------------------------------------

/// Selects yes / the first option without blocking. Used for unattended runs.
pub struct AutoApproveInterviewer;

#[async_trait]
impl Interviewer for AutoApproveInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        Ok(match question.kind {
            QuestionKind::YesNo | QuestionKind::Confirmation => Answer::Yes,
            QuestionKind::MultipleChoice => question
                .default
                .clone()
                .or_else(|| question.options.first().map(|o| o.key.clone()))
                .map(Answer::Choice)
                .unwrap_or(Answer::Skipped),
            QuestionKind::FreeForm => Answer::Text("auto-approved".into()),
        })
    }
}

// ---------------------------------------------------------------------------
// ConsoleInterviewer
// ---------------------------------------------------------------------------

/// Prompts on stdout and reads answers from stdin.
pub struct ConsoleInterviewer;

#[async_trait]
impl Interviewer for ConsoleInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        println!("\n[?] {}", question.text);
        for opt in &question.options {
            println!("  [{}] {}", opt.key, opt.label);
        }
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        let trimmed = input.trim().to_string();

        match question.kind {
            QuestionKind::YesNo | QuestionKind::Confirmation => {
                Ok(if trimmed.eq_ignore_ascii_case("y") || trimmed.eq_ignore_ascii_case("yes") {
                    Answer::Yes
                } else {
                    Answer::No
                })
            }
            QuestionKind::MultipleChoice => {
                for opt in &question.options {
                    if opt.key.eq_ignore_ascii_case(&trimmed)
                        || opt.label.eq_ignore_ascii_case(&trimmed)
                    {
                        return Ok(Answer::Choice(opt.key.clone()));
                    }
                }
                if trimmed.is_empty() {
                    Ok(Answer::Skipped)
                } else {
                    Ok(Answer::Choice(trimmed))
                }
            }
            QuestionKind::FreeForm => Ok(Answer::Text(trimmed)),
        }
    }

    fn inform(&self, message: &str, stage: &str) {
        println!("[{stage}] {message}");
    }
}

// ---------------------------------------------------------------------------
// QueueInterviewer
// ---------------------------------------------------------------------------

/// Replays a pre-seeded answer queue; answers `Skipped` once drained.
pub struct QueueInterviewer {
    answers: Mutex<VecDeque<Answer>>,
}

impl QueueInterviewer {
    pub fn new(answers: Vec<Answer>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
        }
    }
}

#[async_trait]
impl Interviewer for QueueInterviewer {
    async fn ask(&self, _question: &Question) -> Result<Answer> {
        Ok(self
            .answers
            .lock()
            .expect("queue lock poisoned")
            .pop_front()
            .unwrap_or(Answer::Skipped))
    }
}

// ---------------------------------------------------------------------------
// CallbackInterviewer
// ---------------------------------------------------------------------------

/// Delegates to a closure.
pub struct CallbackInterviewer {
    callback: Box<dyn Fn(&Question) -> Answer + Send + Sync>,
}

impl CallbackInterviewer {
    pub fn new(callback: impl Fn(&Question) -> Answer + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl Interviewer for CallbackInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        Ok((self.callback)(question))
    }
}

// ---------------------------------------------------------------------------
// RecordingInterviewer
// ---------------------------------------------------------------------------

/// Decorator that captures every question/answer pair.
pub struct RecordingInterviewer<I> {
    inner: I,
    recordings: Mutex<Vec<(Question, Answer)>>,
}

impl<I: Interviewer> RecordingInterviewer<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            recordings: Mutex::new(Vec::new()),
        }
    }

    pub fn recordings(&self) -> Vec<(Question, Answer)> {
        self.recordings.lock().expect("recordings lock poisoned").clone()
    }
}

#[async_trait]
impl<I: Interviewer> Interviewer for RecordingInterviewer<I> {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        let answer = self.inner.ask(question).await?;
        self.recordings
            .lock()
            .expect("recordings lock poisoned")
            .push((question.clone(), answer.clone()));
        Ok(answer)
    }

    fn inform(&self, message: &str, stage: &str) {
        self.inner.inform(message, stage);
    }
}

// ---------------------------------------------------------------------------
// Accelerator keys
// ---------------------------------------------------------------------------

/// Extract the accelerator key advertised in a choice label: `[A] Approve`,
/// `A) Approve`, or `A - Approve`. Falls back to the first character.
pub fn accelerator_key(label: &str) -> String {
    let pattern = regex::Regex::new(r"^\[([A-Za-z])\]\s|^([A-Za-z])\)\s|^([A-Za-z])\s-\s")
        .expect("accelerator regex is valid");
    if let Some(caps) = pattern.captures(label) {
        for group in caps.iter().skip(1).flatten() {
            return group.as_str().to_uppercase();
        }
    }
    label
        .chars()
        .next()
        .map(|c| c.to_uppercase().to_string())
        .unwrap_or_default()
}
