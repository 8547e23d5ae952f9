//! Report Accumulator: batches notifications until flush.
//!
//! Delivery is by email (`lettre`) when SMTP is configured, else console
//! when running in the foreground, else dropped; an optional
//! syslog-equivalent sink mirrors every section via the `log` crate
//! regardless of delivery.

use lettre::message::Message;
use lettre::transport::smtp::SmtpTransport;
use lettre::Transport;

#[derive(Debug, Default)]
pub struct Report {
    sections: Vec<(String, Vec<String>)>,
}

pub enum Delivery<'a> {
    Email { smtp_host: &'a str, smtp_port: u16, to: &'a str },
    Console,
    /// No delivery channel available (backgrounded with no SMTP
    /// configured). The syslog-equivalent sink still runs if enabled.
    Silent,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_section(&mut self, title: impl Into<String>, items: Vec<String>) {
        if items.is_empty() {
            return;
        }
        self.sections.push((title.into(), items));
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (title, items) in &self.sections {
            out.push_str(&format!("{title}\n"));
            for item in items {
                out.push_str(&format!("  {item}\n"));
            }
        }
        out
    }

    /// Deliver via `delivery`, mirror to the syslog-equivalent sink if
    /// `syslog_report` is set, then clear.
    pub fn flush(&mut self, delivery: Delivery, syslog_report: bool) {
        if self.is_empty() {
            return;
        }
        let body = self.render();

        if syslog_report {
            for (title, items) in &self.sections {
                log::info!(target: "sentryd::report", "{title}: {}", items.join(", "));
            }
        }

        match delivery {
            Delivery::Email { smtp_host, smtp_port, to } => {
                if let Err(e) = self.send_email(smtp_host, smtp_port, to, &body) {
                    log::error!("failed to send report email, falling back to console: {e}");
                    println!("{body}");
                }
            }
            Delivery::Console => println!("{body}"),
            Delivery::Silent => {}
        }

        self.sections.clear();
    }

    fn send_email(&self, smtp_host: &str, smtp_port: u16, to: &str, body: &str) -> anyhow::Result<()> {
        let email = Message::builder()
            .from("sentryd@localhost".parse()?)
            .to(to.parse()?)
            .subject("sentryd report")
            .body(body.to_string())?;
        let mailer = SmtpTransport::builder_dangerous(smtp_host).port(smtp_port).build();
        mailer.send(&email)?;
        Ok(())
    }
}
