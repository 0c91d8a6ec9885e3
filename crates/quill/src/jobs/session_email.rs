//! Session scheduled/cancelled emails.
//!
//! Rendering is pure and memoized, so a retried send never re-renders. Each
//! recipient gets its own send step carrying a dedup key the transport honors,
//! which narrows the re-send window left by at-least-once step execution.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use quill_core::capability::{EmailMessage, Mailer};
use quill_core::error::{QuillError, Result};
use quill_core::function::{FunctionInfo, QuillFunction, RetryConfig};
use quill_core::step::StepContext;

use super::escape_html;
use crate::ports::{DeliveryEntry, DeliveryLog};

#[derive(Debug, Clone, Deserialize)]
pub struct Recipient {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Overrides the session locale.
    #[serde(default)]
    pub locale: Option<String>,
    /// Overrides the session timezone.
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInput {
    pub session_id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    /// IANA timezone name.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default)]
    pub join_url: Option<String>,
    /// Why a session was cancelled.
    #[serde(default)]
    pub reason: Option<String>,
    pub recipients: Vec<Recipient>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_locale() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Scheduled,
    Cancelled,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locale {
    En,
    Es,
    Fr,
    De,
    Pt,
}

impl Locale {
    /// Resolve a language tag like `pt-BR` by its primary subtag. Unknown
    /// languages fall back to English.
    pub fn resolve(tag: &str) -> Self {
        let primary = tag
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match primary.as_str() {
            "es" => Self::Es,
            "fr" => Self::Fr,
            "de" => Self::De,
            "pt" => Self::Pt,
            _ => Self::En,
        }
    }
}

struct Strings {
    weekdays: [&'static str; 7],
    months: [&'static str; 12],
    greeting: &'static str,
    scheduled_subject: &'static str,
    scheduled_body: &'static str,
    cancelled_subject: &'static str,
    cancelled_body: &'static str,
    duration: &'static str,
    reason: &'static str,
    join: &'static str,
}

fn strings(locale: Locale) -> &'static Strings {
    match locale {
        Locale::En => &EN,
        Locale::Es => &ES,
        Locale::Fr => &FR,
        Locale::De => &DE,
        Locale::Pt => &PT,
    }
}

static EN: Strings = Strings {
    weekdays: ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday"],
    months: [
        "January", "February", "March", "April", "May", "June", "July", "August", "September",
        "October", "November", "December",
    ],
    greeting: "Hi {name},",
    scheduled_subject: "Session scheduled: {title}",
    scheduled_body: "Your session \"{title}\" is scheduled for {when}.",
    cancelled_subject: "Session cancelled: {title}",
    cancelled_body: "Your session \"{title}\" on {when} has been cancelled.",
    duration: "Duration: {minutes} minutes",
    reason: "Reason",
    join: "Join the session",
};

static ES: Strings = Strings {
    weekdays: ["lunes", "martes", "miércoles", "jueves", "viernes", "sábado", "domingo"],
    months: [
        "enero", "febrero", "marzo", "abril", "mayo", "junio", "julio", "agosto", "septiembre",
        "octubre", "noviembre", "diciembre",
    ],
    greeting: "Hola {name}:",
    scheduled_subject: "Sesión programada: {title}",
    scheduled_body: "Tu sesión «{title}» está programada para el {when}.",
    cancelled_subject: "Sesión cancelada: {title}",
    cancelled_body: "Tu sesión «{title}» del {when} ha sido cancelada.",
    duration: "Duración: {minutes} minutos",
    reason: "Motivo",
    join: "Unirse a la sesión",
};

static FR: Strings = Strings {
    weekdays: ["lundi", "mardi", "mercredi", "jeudi", "vendredi", "samedi", "dimanche"],
    months: [
        "janvier", "février", "mars", "avril", "mai", "juin", "juillet", "août", "septembre",
        "octobre", "novembre", "décembre",
    ],
    greeting: "Bonjour {name},",
    scheduled_subject: "Séance planifiée : {title}",
    scheduled_body: "Votre séance « {title} » est prévue le {when}.",
    cancelled_subject: "Séance annulée : {title}",
    cancelled_body: "Votre séance « {title} » du {when} a été annulée.",
    duration: "Durée : {minutes} minutes",
    reason: "Motif",
    join: "Rejoindre la séance",
};

static DE: Strings = Strings {
    weekdays: ["Montag", "Dienstag", "Mittwoch", "Donnerstag", "Freitag", "Samstag", "Sonntag"],
    months: [
        "Januar", "Februar", "März", "April", "Mai", "Juni", "Juli", "August", "September",
        "Oktober", "November", "Dezember",
    ],
    greeting: "Hallo {name},",
    scheduled_subject: "Sitzung geplant: {title}",
    scheduled_body: "Deine Sitzung „{title}“ findet am {when} statt.",
    cancelled_subject: "Sitzung abgesagt: {title}",
    cancelled_body: "Deine Sitzung „{title}“ am {when} wurde abgesagt.",
    duration: "Dauer: {minutes} Minuten",
    reason: "Grund",
    join: "Zur Sitzung",
};

static PT: Strings = Strings {
    weekdays: [
        "segunda-feira", "terça-feira", "quarta-feira", "quinta-feira", "sexta-feira", "sábado",
        "domingo",
    ],
    months: [
        "janeiro", "fevereiro", "março", "abril", "maio", "junho", "julho", "agosto", "setembro",
        "outubro", "novembro", "dezembro",
    ],
    greeting: "Olá {name},",
    scheduled_subject: "Sessão agendada: {title}",
    scheduled_body: "A sua sessão \"{title}\" está agendada para {when}.",
    cancelled_subject: "Sessão cancelada: {title}",
    cancelled_body: "A sua sessão \"{title}\" de {when} foi cancelada.",
    duration: "Duração: {minutes} minutos",
    reason: "Motivo",
    join: "Entrar na sessão",
};

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| QuillError::Validation(format!("unknown timezone '{name}'")))
}

/// Format an instant as local date and time for a reader of `locale`.
pub fn format_when(at: DateTime<Utc>, tz: Tz, locale: Locale) -> String {
    let local = at.with_timezone(&tz);
    let s = strings(locale);
    let weekday = s.weekdays[local.weekday().num_days_from_monday() as usize];
    let month = s.months[local.month0() as usize];
    let (day, year) = (local.day(), local.year());
    let (hour, minute) = (local.hour(), local.minute());
    let zone = local.format("%Z");

    match locale {
        Locale::En => {
            let (pm, hour12) = local.hour12();
            let meridiem = if pm { "PM" } else { "AM" };
            format!("{weekday}, {month} {day}, {year} at {hour12}:{minute:02} {meridiem} {zone}")
        }
        Locale::Es => format!("{weekday}, {day} de {month} de {year}, {hour:02}:{minute:02} ({zone})"),
        Locale::Fr => format!("{weekday} {day} {month} {year} à {hour:02}:{minute:02} ({zone})"),
        Locale::De => format!("{weekday}, {day}. {month} {year} um {hour:02}:{minute:02} Uhr ({zone})"),
        Locale::Pt => format!("{weekday}, {day} de {month} de {year} às {hour:02}:{minute:02} ({zone})"),
    }
}

/// A rendered message for one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Render one message per distinct recipient.
pub fn render(kind: SessionKind, input: &SessionInput) -> Result<Vec<RenderedEmail>> {
    let session_tz = parse_timezone(&input.timezone)?;
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(input.recipients.len());

    for recipient in &input.recipients {
        let to = recipient.email.trim().to_lowercase();
        if to.is_empty() || !seen.insert(to.clone()) {
            continue;
        }
        let locale = Locale::resolve(recipient.locale.as_deref().unwrap_or(&input.locale));
        let tz = match &recipient.timezone {
            Some(name) => parse_timezone(name)?,
            None => session_tz,
        };
        let s = strings(locale);
        let when = format_when(input.starts_at, tz, locale);
        let fill = |template: &str, title: &str, when: &str| {
            template.replace("{title}", title).replace("{when}", when)
        };

        let (subject, body) = match kind {
            SessionKind::Scheduled => (s.scheduled_subject, s.scheduled_body),
            SessionKind::Cancelled => (s.cancelled_subject, s.cancelled_body),
        };
        let name = recipient.name.as_deref().map(str::trim).filter(|n| !n.is_empty());

        let mut text = Vec::new();
        let mut html = Vec::new();
        if let Some(name) = name {
            text.push(s.greeting.replace("{name}", name));
            html.push(format!("<p>{}</p>", s.greeting.replace("{name}", &escape_html(name))));
        }
        text.push(fill(body, &input.title, &when));
        html.push(format!(
            "<p>{}</p>",
            fill(body, &escape_html(&input.title), &escape_html(&when))
        ));

        if kind == SessionKind::Scheduled {
            if let Some(minutes) = input.duration_minutes {
                let line = s.duration.replace("{minutes}", &minutes.to_string());
                html.push(format!("<p>{}</p>", escape_html(&line)));
                text.push(line);
            }
            if let Some(url) = &input.join_url {
                text.push(format!("{}: {url}", s.join));
                html.push(format!(
                    "<p><a href=\"{}\">{}</a></p>",
                    escape_html(url),
                    escape_html(s.join)
                ));
            }
        }
        if kind == SessionKind::Cancelled {
            if let Some(reason) = input.reason.as_deref().filter(|r| !r.trim().is_empty()) {
                text.push(format!("{}: {reason}", s.reason));
                html.push(format!("<p>{}: {}</p>", s.reason, escape_html(reason)));
            }
        }

        out.push(RenderedEmail {
            to,
            subject: subject.replace("{title}", &input.title),
            html: html.concat(),
            text: text.join("\n\n"),
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEmailReport {
    pub session_id: String,
    pub kind: String,
    pub sent: usize,
    pub delivery_ids: Vec<String>,
}

/// Shared body of both session jobs.
async fn deliver(
    ctx: &StepContext,
    kind: SessionKind,
    input: SessionInput,
    mailer: &dyn Mailer,
    log: &dyn DeliveryLog,
) -> Result<SessionEmailReport> {
    let emails: Vec<RenderedEmail> = ctx
        .step("render", || async { render(kind, &input) })
        .run()
        .await?;

    let mut entries = Vec::with_capacity(emails.len());
    for email in &emails {
        let message = EmailMessage {
            to: email.to.clone(),
            subject: email.subject.clone(),
            html: email.html.clone(),
            text: Some(email.text.clone()),
            idempotency_key: Some(format!(
                "session:{}:{}:{}",
                input.session_id,
                kind.as_str(),
                email.to
            )),
        };
        let delivery_id: String = ctx.step("send", || mailer.send(message)).run().await?;
        entries.push(DeliveryEntry {
            session_id: input.session_id.clone(),
            kind: kind.as_str().to_string(),
            email: email.to.clone(),
            delivery_id,
        });
    }

    ctx.step("record-delivery", || log.record(&entries))
        .run()
        .await?;

    tracing::info!(
        session_id = %input.session_id,
        kind = kind.as_str(),
        sent = entries.len(),
        "Session emails delivered"
    );

    Ok(SessionEmailReport {
        session_id: input.session_id,
        kind: kind.as_str().to_string(),
        sent: entries.len(),
        delivery_ids: entries.into_iter().map(|e| e.delivery_id).collect(),
    })
}

/// Emails attendees when a session is scheduled.
pub struct SessionNotification {
    mailer: Arc<dyn Mailer>,
    log: Arc<dyn DeliveryLog>,
}

impl SessionNotification {
    pub fn new(mailer: Arc<dyn Mailer>, log: Arc<dyn DeliveryLog>) -> Self {
        Self { mailer, log }
    }
}

impl QuillFunction for SessionNotification {
    type Input = SessionInput;
    type Output = SessionEmailReport;

    fn info(&self) -> FunctionInfo {
        FunctionInfo::new("session-notification", "sessions/scheduled")
            .named("Session scheduled email")
            .retry(RetryConfig::attempts(5))
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a StepContext,
        input: SessionInput,
    ) -> BoxFuture<'a, Result<SessionEmailReport>> {
        Box::pin(deliver(
            ctx,
            SessionKind::Scheduled,
            input,
            self.mailer.as_ref(),
            self.log.as_ref(),
        ))
    }
}

/// Emails attendees when a session is cancelled.
pub struct SessionCancellation {
    mailer: Arc<dyn Mailer>,
    log: Arc<dyn DeliveryLog>,
}

impl SessionCancellation {
    pub fn new(mailer: Arc<dyn Mailer>, log: Arc<dyn DeliveryLog>) -> Self {
        Self { mailer, log }
    }
}

impl QuillFunction for SessionCancellation {
    type Input = SessionInput;
    type Output = SessionEmailReport;

    fn info(&self) -> FunctionInfo {
        FunctionInfo::new("session-cancellation", "sessions/cancelled")
            .named("Session cancelled email")
            .retry(RetryConfig::attempts(5))
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a StepContext,
        input: SessionInput,
    ) -> BoxFuture<'a, Result<SessionEmailReport>> {
        Box::pin(deliver(
            ctx,
            SessionKind::Cancelled,
            input,
            self.mailer.as_ref(),
            self.log.as_ref(),
        ))
    }
}
