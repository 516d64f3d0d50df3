use crate::crawl::types::Plan;

/// Priority band for the single seed job of a crawl.
pub const SEED_PRIORITY: i32 = 15;

/// Priority band for sitemap-derived jobs from a small sitemap, and for
/// URLs discovered during crawling.
pub const SITEMAP_PRIORITY: i32 = 20;

/// Base priority when a sitemap is large enough to warrant demotion.
pub const LARGE_SITEMAP_BASE_PRIORITY: i32 = 21;

/// Sitemaps beyond this many entries go through the priority policy.
pub const LARGE_SITEMAP_THRESHOLD: usize = 1000;

const MAX_DEMOTION: i32 = 5;

/// Pending-job count above which a tenant's bulk work starts getting
/// demoted. Higher plans tolerate more load before demotion, so a higher
/// plan never receives a worse priority than a lower one at the same base.
fn load_threshold(plan: Plan) -> u64 {
    match plan {
        Plan::Free => 25,
        Plan::Hobby => 50,
        Plan::Standard => 100,
        Plan::Growth => 200,
        Plan::Scale => 400,
    }
}

/// Map (plan, current tenant load, base priority) to a priority band.
/// Lower is sooner. Demotion is bounded regardless of load.
pub fn job_priority(plan: Plan, tenant_load: u64, base_priority: i32) -> i32 {
    let threshold = load_threshold(plan);
    if tenant_load <= threshold {
        return base_priority;
    }

    let over = (tenant_load / threshold) as i32;
    base_priority + over.min(MAX_DEMOTION)
}
