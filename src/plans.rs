// src/plans.rs
use crate::models::user::User;
use chrono::{Duration, Utc};

/// A billing tier and the quotas enforced for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub name: &'static str,
    pub slug: &'static str,
    /// PDFs per month (enforced by the upload collaborator's routing).
    pub quota_pdfs: u32,
    /// Page-count ceiling enforced by the upload completion pipeline.
    pub pages_per_pdf: usize,
    /// Upload size ceilings mirror the enforcement config; the pro value
    /// sitting below the free one looks swapped, but the enforcement
    /// config is what ships. Size is enforced upstream, not here.
    pub max_upload_mb: u32,
    /// Passages retrieved per question.
    pub results_per_query: u64,
    pub price_cents: u32,
}

impl Plan {
    pub fn free() -> Self {
        Plan {
            name: "Free",
            slug: "free",
            quota_pdfs: 10,
            pages_per_pdf: 5,
            max_upload_mb: 32,
            results_per_query: 4,
            price_cents: 0,
        }
    }

    pub fn pro() -> Self {
        Plan {
            name: "Pro",
            slug: "pro",
            quota_pdfs: 50,
            pages_per_pdf: 25,
            max_upload_mb: 16,
            results_per_query: 8,
            price_cents: 1400,
        }
    }

    pub fn for_slug(slug: &str) -> Self {
        match slug {
            "pro" => Plan::pro(),
            "free" => Plan::free(),
            other => {
                tracing::warn!("Unknown plan slug: {}, falling back to free", other);
                Plan::free()
            }
        }
    }
}

/// A user's effective plan, derived from their subscription fields.
#[derive(Debug, Clone)]
pub struct SubscriptionStatus {
    pub plan: Plan,
    pub is_subscribed: bool,
    pub stripe_customer_id: Option<String>,
}

/// Subscribed means an active subscription whose period end (plus one day
/// of grace for webhook lag) has not passed.
pub fn resolve_subscription(user: &User) -> SubscriptionStatus {
    let is_subscribed = user.stripe_subscription_id.is_some()
        && user
            .stripe_current_period_end
            .map(|end| end + Duration::days(1) > Utc::now())
            .unwrap_or(false);

    SubscriptionStatus {
        plan: if is_subscribed { Plan::pro() } else { Plan::free() },
        is_subscribed,
        stripe_customer_id: user.stripe_customer_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user_with(
        subscription: Option<&str>,
        period_end: Option<chrono::DateTime<chrono::Utc>>,
    ) -> User {
        User {
            id: "u1".to_string(),
            email: "u1@example.com".to_string(),
            stripe_customer_id: subscription.map(|_| "cus_123".to_string()),
            stripe_subscription_id: subscription.map(|s| s.to_string()),
            stripe_price_id: subscription.map(|_| "price_123".to_string()),
            stripe_current_period_end: period_end,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn free_user_gets_free_quotas() {
        let status = resolve_subscription(&user_with(None, None));
        assert!(!status.is_subscribed);
        assert_eq!(status.plan.pages_per_pdf, 5);
        assert_eq!(status.plan.results_per_query, 4);
    }

    #[test]
    fn active_subscription_resolves_to_pro() {
        let end = Utc::now() + Duration::days(20);
        let status = resolve_subscription(&user_with(Some("sub_1"), Some(end)));
        assert!(status.is_subscribed);
        assert_eq!(status.plan.slug, "pro");
        assert_eq!(status.plan.pages_per_pdf, 25);
    }

    #[test]
    fn lapsed_subscription_falls_back_to_free_after_grace() {
        let end = Utc::now() - Duration::days(2);
        let status = resolve_subscription(&user_with(Some("sub_1"), Some(end)));
        assert!(!status.is_subscribed);
        assert_eq!(status.plan.slug, "free");
    }

    #[test]
    fn recently_lapsed_subscription_keeps_grace_day() {
        let end = Utc::now() - Duration::hours(12);
        let status = resolve_subscription(&user_with(Some("sub_1"), Some(end)));
        assert!(status.is_subscribed);
    }

    #[test]
    fn unknown_slug_falls_back_to_free() {
        assert_eq!(Plan::for_slug("enterprise").slug, "free");
        assert_eq!(Plan::for_slug("pro").slug, "pro");
    }
}
