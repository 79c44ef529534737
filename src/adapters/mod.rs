pub mod http_page;
pub mod operator;
pub mod page;
pub mod webhook;

pub use http_page::{HttpBrowser, HttpPage};
pub use operator::{ChallengeKind, ChallengePrompt, ConsoleOperator, HumanChannel, SessionHandle};
pub use page::{Browser, Capture, PageDriver};
pub use webhook::WebhookNotifier;
