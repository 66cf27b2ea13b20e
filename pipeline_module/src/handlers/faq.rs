//! FAQ responder: answers each question in an email from a curated FAQ.
//!
//! With reviewers configured, the answer goes to them as a supervision task
//! instead of to the correspondent. A reviewer's reply lands on the reply
//! formatter, which sends the polished answer on to the correspondent.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use send_emails_module::OutboundEmail;
use tracing::info;

use crate::addresses::{clean_email_address, extract_addresses};
use crate::context::ServiceContext;
use crate::dispatch::DEFAULT_REPLY_FORMATTER_PREFIX;
use crate::normalize::CanonicalEmail;

use super::reply_formatter::encode_target;
use super::{reply_reference, reply_subject, HandlerError, SUPERVISION_SUBJECT_FLAG};

const EXTRACT_QUESTIONS_PROMPT: &str = "You read emails sent to an FAQ assistant. \
List every distinct question the sender is asking. Rephrase each so it stands on \
its own without the rest of the email. Respond with a JSON array of strings and \
nothing else. Respond with [] when there are no questions.";

const ANSWER_PROMPT_HEADER: &str = "You answer questions using only the FAQ entries \
below. Keep answers short and factual. If the entries do not cover the question, \
say that the team will follow up personally.\n\n# FAQ entries\n";

const REPLY_INTRO: &str = "Hi,\n\nThank you for getting in touch. \
Here are the answers to your questions.";

const FORWARD_PREFIXES: [&str; 2] = ["Fwd: ", "FW: "];
const FORWARDED_MARKER: &str = "forwarded message";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FaqData {
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub entries: Vec<FaqEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FaqEntry {
    pub question: String,
    pub answer: String,
}

impl FaqData {
    pub async fn load(path: &Path) -> Result<Self, HandlerError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| HandlerError::FaqData {
                path: path.to_path_buf(),
                source,
            })?;
        toml::from_str(&contents).map_err(|source| HandlerError::InvalidFaqData {
            path: path.to_path_buf(),
            source,
        })
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!("Q: {}\nA: {}\n\n", entry.question.trim(), entry.answer.trim()));
        }
        out
    }
}

/// Who reviews FAQ answers before they reach the correspondent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaqSupervision {
    /// Empty means answers go straight to the correspondent.
    pub reviewers: Vec<String>,
    /// Agent prefix reviewers reply through.
    pub reply_formatter_prefix: String,
}

impl Default for FaqSupervision {
    fn default() -> Self {
        Self {
            reviewers: Vec::new(),
            reply_formatter_prefix: DEFAULT_REPLY_FORMATTER_PREFIX.to_string(),
        }
    }
}

impl FaqSupervision {
    fn is_reviewer(&self, address: &str) -> bool {
        self.reviewers
            .iter()
            .any(|reviewer| clean_email_address(reviewer) == address)
    }
}

/// The person an answer is meant for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Correspondent {
    address: String,
    subject: String,
    /// The email was forwarded in by someone else.
    forwarded: bool,
}

impl Correspondent {
    fn of(email: &CanonicalEmail) -> Self {
        let subject = email.subject.trim();
        let original_subject = FORWARD_PREFIXES
            .iter()
            .find_map(|prefix| subject.strip_prefix(prefix));
        let Some(original_subject) = original_subject else {
            return Self {
                address: email.user_email.clone(),
                subject: reply_subject(subject),
                forwarded: false,
            };
        };

        let first_reply_line = email.plain_replies_only.lines().next().unwrap_or_default();
        let source = if first_reply_line.starts_with("From: ") {
            first_reply_line.to_string()
        } else {
            let lowered = email.plain_all_content.to_lowercase();
            match lowered.rsplit_once(FORWARDED_MARKER) {
                Some((_, after)) => after.to_string(),
                None => email.from.clone(),
            }
        };
        let address = extract_addresses(&source)
            .into_iter()
            .next()
            .unwrap_or_else(|| clean_email_address(&email.from));
        Self {
            address,
            subject: reply_subject(original_subject),
            forwarded: true,
        }
    }
}

pub(super) fn faq_path(faq_dir: &Path, agent_name: &str) -> PathBuf {
    faq_dir.join(format!("{}.toml", agent_name))
}

/// Parses the model's question list, tolerating a fenced code block.
pub(super) fn parse_question_list(raw: &str) -> Result<Vec<String>, HandlerError> {
    let start = raw.find('[');
    let end = raw.rfind(']');
    let slice = match (start, end) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => return Err(HandlerError::InvalidQuestionList(raw.to_string())),
    };
    let questions: Vec<String> = serde_json::from_str(slice)
        .map_err(|_| HandlerError::InvalidQuestionList(raw.to_string()))?;
    Ok(questions
        .into_iter()
        .map(|question| question.trim().to_string())
        .filter(|question| !question.is_empty())
        .collect())
}

fn compose_reply(answers: &[(String, String)], signature: Option<&str>) -> String {
    let mut body = String::from(REPLY_INTRO);
    body.push_str("\n\n---\n\n");
    for (question, answer) in answers {
        body.push_str(&format!("Q: {}\nA: {}\n\n", question, answer.trim()));
    }
    body.push_str("---");
    if let Some(signature) = signature.map(str::trim).filter(|value| !value.is_empty()) {
        body.push_str("\n\n");
        body.push_str(signature);
    }
    body
}

pub(super) async fn respond_to_faq(
    context: &ServiceContext,
    faq_dir: &Path,
    supervision: &FaqSupervision,
    email: &CanonicalEmail,
) -> Result<(), HandlerError> {
    let scope = email.user_email.as_str();
    if email.subject.to_lowercase().contains("unsubscribe") {
        info!("[{}] unsubscribe in subject, not replying", scope);
        return Ok(());
    }

    let correspondent = Correspondent::of(email);
    if supervision.is_reviewer(&correspondent.address) {
        info!(
            "[{}] answer would go to reviewer {}, breaking the loop",
            scope, correspondent.address
        );
        return Ok(());
    }
    if email.plain_all_content.trim().is_empty() {
        info!("[{}] empty email, nothing to answer", scope);
        return Ok(());
    }

    let faq = FaqData::load(&faq_path(faq_dir, &email.agent_name)).await?;
    let completion = context.completion();

    let raw_questions = completion
        .complete(EXTRACT_QUESTIONS_PROMPT, &email.plain_all_content)
        .await?;
    let questions = parse_question_list(&raw_questions)?;
    if questions.is_empty() {
        info!("[{}] no questions found, not replying", scope);
        return Ok(());
    }
    info!("[{}] answering {} question(s)", scope, questions.len());

    let answer_prompt = format!("{}{}", ANSWER_PROMPT_HEADER, faq.render());
    let mut answers = Vec::with_capacity(questions.len());
    for question in questions {
        let answer = completion.complete(&answer_prompt, &question).await?;
        answers.push((question, answer));
    }
    let body = compose_reply(&answers, faq.signature.as_deref());

    let reply = if supervision.reviewers.is_empty() {
        let mut reply = OutboundEmail::plain(
            email.agent_address(),
            vec![correspondent.address.clone()],
            correspondent.subject.clone(),
            body,
        );
        if !correspondent.forwarded {
            reply.in_reply_to = reply_reference(email);
        }
        reply
    } else {
        info!(
            "[{}] sending answer for {} to reviewers",
            scope, correspondent.address
        );
        let mut task = OutboundEmail::plain(
            email.agent_address(),
            supervision.reviewers.clone(),
            format!("{} {}", SUPERVISION_SUBJECT_FLAG, correspondent.subject),
            body,
        );
        task.reply_to = Some(encode_target(
            &supervision.reply_formatter_prefix,
            &correspondent.address,
            &email.agent_domain,
        ));
        task
    };
    context.transport().send_email(scope, &reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_fixtures::{context_for, email_to};
    use mockito::Matcher;
    use serde_json::json;
    use tempfile::TempDir;

    const FAQ_TOML: &str = r#"
signature = "The Pathways Team"

[[entries]]
question = "What is the application fee?"
answer = "The fee is $100."
"#;

    fn completion_body(content: &str) -> String {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]}).to_string()
    }

    fn write_faq(dir: &Path) {
        std::fs::write(dir.join("jims-ac-faq.toml"), FAQ_TOML).unwrap();
    }

    #[test]
    fn question_list_accepts_fenced_json() {
        let raw = "```json\n[\"What is the fee?\", \" \"]\n```";
        assert_eq!(
            parse_question_list(raw).unwrap(),
            vec!["What is the fee?".to_string()]
        );
        assert!(matches!(
            parse_question_list("no list"),
            Err(HandlerError::InvalidQuestionList(_))
        ));
    }

    #[test]
    fn faq_data_parses_entries() {
        let data: FaqData = toml::from_str(FAQ_TOML).unwrap();
        assert_eq!(data.entries.len(), 1);
        assert_eq!(data.signature.as_deref(), Some("The Pathways Team"));
        assert!(data.render().contains("Q: What is the application fee?\nA: The fee is $100."));
    }

    #[test]
    fn reply_lists_questions_and_answers() {
        let body = compose_reply(
            &[("What is the fee?".to_string(), "$100.\n".to_string())],
            Some("Alex"),
        );
        assert!(body.starts_with("Hi,"));
        assert!(body.contains("---\n\nQ: What is the fee?\nA: $100.\n\n---"));
        assert!(body.ends_with("\n\nAlex"));
    }

    #[test]
    fn forwarded_email_is_answered_for_the_original_sender() {
        let mut email = email_to("jims-ac-faq", "Can you help?");
        email.subject = "Fwd: Entry".to_string();
        email.plain_replies_only = "From: Jo Smith <Jo@Example.com>\nSent: today".to_string();
        let correspondent = Correspondent::of(&email);
        assert_eq!(correspondent.address, "jo@example.com");
        assert_eq!(correspondent.subject, "Re: Entry");
        assert!(correspondent.forwarded);

        email.subject = "FW: Entry".to_string();
        email.plain_replies_only = String::new();
        email.plain_all_content = "See below.\n---------- Forwarded message ---------\n\
            From: Sam <sam@example.net>\nWhat is the fee?"
            .to_string();
        assert_eq!(Correspondent::of(&email).address, "sam@example.net");

        email.subject = "Fees".to_string();
        let direct = Correspondent::of(&email);
        assert_eq!(direct.address, "student@example.com");
        assert_eq!(direct.subject, "Re: Fees");
        assert!(!direct.forwarded);
    }

    #[tokio::test]
    async fn unsubscribe_and_reviewer_loops_are_not_answered() {
        let temp = TempDir::new().expect("tempdir");
        // Nothing listens here, so any model or postal call would fail.
        let context = context_for("http://127.0.0.1:9");

        let mut email = email_to("jims-ac-faq", "Please stop");
        email.subject = "UNSUBSCRIBE me".to_string();
        respond_to_faq(&context, temp.path(), &FaqSupervision::default(), &email)
            .await
            .unwrap();

        let supervision = FaqSupervision {
            reviewers: vec!["Desk <Student@example.com>".to_string()],
            ..FaqSupervision::default()
        };
        let email = email_to("jims-ac-faq", "What is the fee?");
        respond_to_faq(&context, temp.path(), &supervision, &email)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn supervised_answer_goes_to_reviewers_with_formatter_reply_to() {
        let temp = TempDir::new().expect("tempdir");
        write_faq(temp.path());
        let mut server = mockito::Server::new_async().await;
        let _extract = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::Regex("List every distinct question".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion_body("[\"What is the application fee?\"]"))
            .create_async()
            .await;
        let _answer = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::Regex("You answer questions".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion_body("The fee is $100."))
            .create_async()
            .await;
        let send = server
            .mock("POST", "/api/v1/send/message")
            .match_body(Matcher::PartialJson(json!({
                "from": "jims-ac-faq@assistance.chat",
                "to": ["desk@example.org"],
                "subject": "[SUPERVISION TASK] Re: Fees",
                "reply_to": "reply-formatter===student==example.com@assistance.chat"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"success","data":{"message_id":"m-5"}}"#)
            .expect(1)
            .create_async()
            .await;

        let supervision = FaqSupervision {
            reviewers: vec!["desk@example.org".to_string()],
            ..FaqSupervision::default()
        };
        let context = context_for(&server.url());
        let email = email_to("jims-ac-faq", "Hi, what is the application fee?");
        respond_to_faq(&context, temp.path(), &supervision, &email)
            .await
            .unwrap();
        send.assert_async().await;
    }

    #[tokio::test]
    async fn missing_faq_file_is_an_error() {
        let temp = TempDir::new().expect("tempdir");
        let context = context_for("http://127.0.0.1:9");
        let email = email_to("jims-ac-faq", "What is the fee?");
        let err = respond_to_faq(&context, temp.path(), &FaqSupervision::default(), &email)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::FaqData { .. }));
    }

    #[tokio::test]
    async fn answers_questions_and_replies_to_user() {
        let temp = TempDir::new().expect("tempdir");
        write_faq(temp.path());
        let mut server = mockito::Server::new_async().await;
        let extract = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::Regex("List every distinct question".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion_body("[\"What is the application fee?\"]"))
            .expect(1)
            .create_async()
            .await;
        let answer = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::Regex("You answer questions".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion_body("The fee is $100."))
            .expect(1)
            .create_async()
            .await;
        let send = server
            .mock("POST", "/api/v1/send/message")
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(json!({
                    "from": "jims-ac-faq@assistance.chat",
                    "to": ["student@example.com"],
                    "subject": "Re: Fees",
                    "headers": {"In-Reply-To": "<m-1@example.com>"}
                })),
                Matcher::Regex("Q: What is the application fee".to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"success","data":{"message_id":"m-3"}}"#)
            .expect(1)
            .create_async()
            .await;

        let context = context_for(&server.url());
        let email = email_to("jims-ac-faq", "Hi, what is the application fee?");
        respond_to_faq(&context, temp.path(), &FaqSupervision::default(), &email).await.unwrap();

        extract.assert_async().await;
        answer.assert_async().await;
        send.assert_async().await;
    }

    #[tokio::test]
    async fn no_questions_means_no_reply() {
        let temp = TempDir::new().expect("tempdir");
        write_faq(temp.path());
        let mut server = mockito::Server::new_async().await;
        let _extract = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion_body("[]"))
            .create_async()
            .await;
        let send = server
            .mock("POST", "/api/v1/send/message")
            .expect(0)
            .create_async()
            .await;

        let context = context_for(&server.url());
        let email = email_to("jims-ac-faq", "Thanks for your help!");
        respond_to_faq(&context, temp.path(), &FaqSupervision::default(), &email).await.unwrap();
        send.assert_async().await;
    }
}
