//! Confirmation poller: waits for out-of-band codes delivered to the
//! shared mailbox.

pub mod codes;
pub mod poller;

pub use codes::extract_code;
pub use poller::{ConfirmationPoller, ImapMailbox, MailMessage, Mailbox, UnconfiguredMailbox};
