//! Notifier stage: sends one interview invitation per invited pair.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::channel::{Payload, Stage, StageResult, WorkItem};
use crate::models::failure::StageFailure;
use crate::models::matching::{Decision, InviteContext, PairKey};
use crate::stages::{wrong_payload, StageHandler};
use crate::store::StateStore;

/// A rendered invitation, ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Invitation {
    pub to: String,
    pub to_name: String,
    pub subject: String,
    pub body: String,
}

impl Invitation {
    pub fn compose(context: &InviteContext, to: &str, company: &str) -> Self {
        let mut body = format!(
            "Dear {},\n\n\
             Thank you for your interest in {company}. We reviewed your resume for the \
             {} position and would like to invite you to an interview.\n",
            context.candidate_name, context.job_title
        );
        if !context.matching_skills.is_empty() {
            body.push_str(&format!(
                "\nYour experience with {} stood out to us.\n",
                context.matching_skills.join(", ")
            ));
        }
        body.push_str(&format!(
            "\nPlease reply with a few times that suit you over the coming week.\n\n\
             Best regards,\n{company} Recruiting\n"
        ));

        Self {
            to: to.to_string(),
            to_name: context.candidate_name.clone(),
            subject: format!("Interview Invitation: {} Position", context.job_title),
            body,
        }
    }
}

#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    async fn send(&self, invitation: &Invitation) -> Result<(), StageFailure>;
}

pub struct NotifierStage {
    store: Arc<dyn StateStore>,
    mailer: Arc<dyn Mailer>,
    company: String,
}

impl NotifierStage {
    pub fn new(store: Arc<dyn StateStore>, mailer: Arc<dyn Mailer>, company: String) -> Self {
        Self {
            store,
            mailer,
            company,
        }
    }
}

#[async_trait]
impl StageHandler for NotifierStage {
    fn stage(&self) -> Stage {
        Stage::Notify
    }

    async fn handle(&self, item: &WorkItem) -> Result<StageResult, StageFailure> {
        let Payload::SendInvite {
            job_id,
            candidate_id,
            context,
        } = &item.payload
        else {
            return Err(wrong_payload(self.stage(), item));
        };
        let key = PairKey::new(job_id.as_str(), candidate_id.as_str());

        let record = self
            .store
            .match_record(&key)
            .await
            .map_err(|e| StageFailure::transient(format!("store unavailable: {e}")))?
            .ok_or_else(|| StageFailure::permanent(format!("no match recorded for {key}")))?;

        if let Some(delivered_at) = record.invite_sent_at {
            debug!("Invite for {key} already sent at {delivered_at}");
            return Ok(StageResult::InviteDelivered {
                delivered_at,
                already_sent: true,
            });
        }
        if record.decision != Decision::Invited {
            return Err(StageFailure::permanent(format!(
                "match {key} is {}, not invited",
                record.decision
            )));
        }

        let to = context
            .candidate_email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                StageFailure::permanent(format!("candidate {candidate_id} has no email address"))
            })?;

        let invitation = Invitation::compose(context, to, &self.company);
        self.mailer.send(&invitation).await?;
        info!("Invitation for {} sent to {to}", context.job_title);

        Ok(StageResult::InviteDelivered {
            delivered_at: Utc::now(),
            already_sent: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::models::candidate::{CandidateFields, NewCandidate};
    use crate::models::failure::FailureKind;
    use crate::models::job::{JobSummary, NewJob};
    use crate::models::matching::{MatchDetails, MatchScore};
    use crate::store::{InviteOutcome, MemoryStore, Origin};

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<Invitation>>,
    }

    #[async_trait]
    impl Mailer for Outbox {
        async fn send(&self, invitation: &Invitation) -> Result<(), StageFailure> {
            self.sent.lock().unwrap().push(invitation.clone());
            Ok(())
        }
    }

    fn context(email: Option<&str>) -> InviteContext {
        InviteContext {
            candidate_name: "Jane Doe".to_string(),
            candidate_email: email.map(str::to_string),
            job_title: "Software Engineer".to_string(),
            score: 0.85,
            matching_skills: vec!["Python".to_string(), "SQL".to_string()],
        }
    }

    fn invite(email: Option<&str>) -> WorkItem {
        WorkItem::new(Payload::SendInvite {
            job_id: "job123".to_string(),
            candidate_id: "resumeA".to_string(),
            context: context(email),
        })
    }

    async fn decided_store(decision: Decision) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .admit_job(
                &NewJob {
                    job_id: "job123".to_string(),
                    title: "Software Engineer".to_string(),
                    raw_text: "Python".to_string(),
                },
                Origin::Intake,
            )
            .await
            .unwrap();
        store
            .admit_candidate(
                &NewCandidate {
                    candidate_id: "resumeA".to_string(),
                    source_ref: "resumeA.pdf".to_string(),
                },
                Origin::Intake,
            )
            .await
            .unwrap();
        store
            .complete_job("job123", &JobSummary::default())
            .await
            .unwrap();
        store
            .complete_candidate("resumeA", &CandidateFields::default())
            .await
            .unwrap();
        store
            .decide_match(
                &PairKey::new("job123", "resumeA"),
                &MatchScore {
                    score: 0.85,
                    details: MatchDetails::default(),
                },
                decision,
                None,
            )
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_invitation_subject_and_body() {
        let invitation = Invitation::compose(&context(None), "jane@example.com", "Acme");
        assert_eq!(invitation.subject, "Interview Invitation: Software Engineer Position");
        assert!(invitation.body.starts_with("Dear Jane Doe,"));
        assert!(invitation.body.contains("Python, SQL"));
        assert!(invitation.body.contains("Acme Recruiting"));
    }

    #[tokio::test]
    async fn test_invited_pair_is_mailed_once() {
        let store = decided_store(Decision::Invited).await;
        let mailer = Arc::new(Outbox::default());
        let stage = NotifierStage::new(store.clone(), mailer.clone(), "Acme".to_string());

        let result = stage.handle(&invite(Some("jane@example.com"))).await.unwrap();
        assert!(matches!(
            result,
            StageResult::InviteDelivered {
                already_sent: false,
                ..
            }
        ));
        assert_eq!(mailer.sent.lock().unwrap()[0].to, "jane@example.com");
    }

    #[tokio::test]
    async fn test_recorded_delivery_skips_the_send() {
        let store = decided_store(Decision::Invited).await;
        let sent_at = Utc::now();
        store
            .record_invite_outcome(
                &PairKey::new("job123", "resumeA"),
                &InviteOutcome::Delivered { at: sent_at },
                None,
            )
            .await
            .unwrap();
        let mailer = Arc::new(Outbox::default());
        let stage = NotifierStage::new(store, mailer.clone(), "Acme".to_string());

        let result = stage.handle(&invite(Some("jane@example.com"))).await.unwrap();
        assert_eq!(
            result,
            StageResult::InviteDelivered {
                delivered_at: sent_at,
                already_sent: true,
            }
        );
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_email_is_permanent() {
        let store = decided_store(Decision::Invited).await;
        let mailer = Arc::new(Outbox::default());
        let stage = NotifierStage::new(store, mailer.clone(), "Acme".to_string());

        let failure = stage.handle(&invite(Some("  "))).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_pair_is_never_mailed() {
        let store = decided_store(Decision::Rejected).await;
        let mailer = Arc::new(Outbox::default());
        let stage = NotifierStage::new(store, mailer.clone(), "Acme".to_string());

        let failure = stage.handle(&invite(Some("jane@example.com"))).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert!(mailer.sent.lock().unwrap().is_empty());
    }
}
