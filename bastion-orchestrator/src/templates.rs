//! Ready-made rules: rate limiting, bot management and country blocking
//!
//! Templates only produce [`FirewallRule`] values; they are saved through
//! the store like any user-authored rule and compiled the same way.

use bastion_common::{Condition, FirewallRule, LogicalOperator, ProtectionMode, RuleAction};
use serde::Serialize;
use std::collections::BTreeSet;

use crate::error::{Result, SecurityError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateCategory {
    RateLimit,
    BotManagement,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleTemplate {
    pub key: &'static str,
    pub category: TemplateCategory,
    pub name: &'static str,
    pub description: &'static str,
    pub protection_mode: ProtectionMode,
    pub action: RuleAction,
    pub logical_operator: LogicalOperator,
    pub conditions: Vec<Condition>,
    pub priority: i32,
    pub remediation_duration: Option<u64>,
}

impl RuleTemplate {
    /// Unsaved rule built from the template
    pub fn instantiate(&self) -> FirewallRule {
        FirewallRule {
            id: 0,
            config_id: 0,
            name: self.name.to_string(),
            description: Some(self.description.to_string()),
            protection_mode: self.protection_mode,
            action: self.action,
            enabled: true,
            logical_operator: self.logical_operator,
            conditions: self.conditions.clone(),
            priority: self.priority,
            remediation_duration: self.remediation_duration,
        }
    }
}

fn rate_limit(
    key: &'static str,
    name: &'static str,
    description: &'static str,
    conditions: Vec<Condition>,
    duration_seconds: u64,
) -> RuleTemplate {
    RuleTemplate {
        key,
        category: TemplateCategory::RateLimit,
        name,
        description,
        protection_mode: ProtectionMode::PathOnly,
        action: RuleAction::Ban,
        logical_operator: LogicalOperator::And,
        conditions,
        priority: 50,
        remediation_duration: Some(duration_seconds),
    }
}

fn bot_rule(
    key: &'static str,
    name: &'static str,
    description: &'static str,
    user_agent_pattern: &str,
    action: RuleAction,
    priority: i32,
) -> RuleTemplate {
    RuleTemplate {
        key,
        category: TemplateCategory::BotManagement,
        name,
        description,
        protection_mode: ProtectionMode::PathOnly,
        action,
        logical_operator: LogicalOperator::And,
        conditions: vec![Condition::new("user_agent", "regex", user_agent_pattern)],
        priority,
        remediation_duration: None,
    }
}

pub fn catalog() -> Vec<RuleTemplate> {
    let post = || Condition::new("method", "equals", "POST");
    vec![
        rate_limit(
            "api_rate_limit",
            "API Rate Limit",
            "Bans clients hammering the API",
            vec![Condition::new("request_path", "starts_with", "/api/")],
            300,
        ),
        rate_limit(
            "login_brute_force",
            "Login Brute Force Protection",
            "Bans repeated login submissions",
            vec![Condition::new("request_path", "contains", "login"), post()],
            1800,
        ),
        rate_limit(
            "form_submission_limit",
            "Form Submission Limit",
            "Bans spam on contact, feedback and subscribe forms",
            vec![
                Condition::new("request_path", "regex", "/(contact|feedback|subscribe)"),
                post(),
            ],
            7200,
        ),
        rate_limit(
            "download_rate_limit",
            "Download Rate Limit",
            "Bans bulk downloading of archives and media",
            vec![Condition::new(
                "request_path",
                "regex",
                r"\.(pdf|zip|tar|gz|mp4|avi|mkv)$",
            )],
            86400,
        ),
        bot_rule(
            "block_known_bots",
            "Block Known Bots & Crawlers",
            "Blocks common bots, crawlers and scrapers by user agent",
            "(bot|crawler|spider|scraper|slurp|archive|indexer|wget|curl)",
            RuleAction::Ban,
            90,
        ),
        bot_rule(
            "block_aggressive_crawlers",
            "Block Aggressive SEO Crawlers",
            "Blocks SEO crawlers known for heavy crawling",
            "(ahrefs|semrush|majestic|mj12|serpstat|cognitiveseo|linkdex|dotbot|rogerbot|exabot|ezooms)",
            RuleAction::Ban,
            85,
        ),
        bot_rule(
            "challenge_suspicious_bots",
            "Challenge Suspicious Bots with CAPTCHA",
            "Challenges scripted HTTP clients",
            "^(python|java|go-http|ruby|perl|libwww|httpclient)",
            RuleAction::Captcha,
            95,
        ),
        bot_rule(
            "block_scrapers",
            "Block Content Scrapers",
            "Blocks tools used for content scraping and data extraction",
            r"(scrapy|beautifulsoup|selenium|phantomjs|headless|puppeteer|playwright|apify|scrapingbot|import\.io|parsehub)",
            RuleAction::Ban,
            80,
        ),
    ]
}

pub fn find(key: &str) -> Result<RuleTemplate> {
    catalog()
        .into_iter()
        .find(|t| t.key == key)
        .ok_or_else(|| SecurityError::NotFound(format!("rule template {}", key)))
}

/// Rule banning requests from any of the given ISO 3166 alpha-2 countries
pub fn geo_block_rule(countries: &[String]) -> Result<FirewallRule> {
    let mut codes = BTreeSet::new();
    for raw in countries {
        let code = raw.trim().to_ascii_uppercase();
        if code.len() != 2 || !code.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(SecurityError::Validation(format!("invalid country code '{}'", raw)));
        }
        codes.insert(code);
    }
    if codes.is_empty() {
        return Err(SecurityError::Validation("no countries to block".to_string()));
    }

    let listed: Vec<&str> = codes.iter().map(String::as_str).collect();
    let mut name = format!("Geo-Blocking: Block {}", listed[..listed.len().min(3)].join(", "));
    if listed.len() > 3 {
        name.push_str("...");
    }

    Ok(FirewallRule {
        id: 0,
        config_id: 0,
        name,
        description: Some(format!("Block traffic from: {}", listed.join(", "))),
        protection_mode: ProtectionMode::Inband,
        action: RuleAction::Ban,
        enabled: true,
        logical_operator: LogicalOperator::Or,
        conditions: listed
            .iter()
            .map(|code| Condition::new("country_code", "equals", *code))
            .collect(),
        priority: 10,
        remediation_duration: None,
    })
}
