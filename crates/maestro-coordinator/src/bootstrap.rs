use crate::types::{Agent, AgentType, Capability};

/// Host the built-in agents listen on by default.
pub const DEFAULT_AGENT_HOST: &str = "http://127.0.0.1";

/// The platform's built-in agent set, registered `online` at start-up.
pub fn default_agents() -> Vec<Agent> {
    default_agents_at(DEFAULT_AGENT_HOST)
}

/// Built-in agents with addresses on `host`, ports 8101 to 8104.
pub fn default_agents_at(host: &str) -> Vec<Agent> {
    let host = host.trim_end_matches('/');
    vec![
        tutor_agent(host),
        analytics_agent(host),
        content_agent(host),
        recommendation_agent(host),
    ]
}

fn with_capabilities(mut agent: Agent, names: &[&str]) -> Agent {
    for name in names {
        agent = agent.with_capability(Capability::new(*name));
    }
    agent
}

fn tagged(mut agent: Agent, tags: &[&str]) -> Agent {
    agent.config.discovery.tags = tags.iter().map(|t| (*t).to_string()).collect();
    agent
}

fn tutor_agent(host: &str) -> Agent {
    let agent = Agent::new("tutor", "Conversational Tutor", AgentType::Conversational)
        .with_address(format!("{host}:8101"));
    let agent = with_capabilities(agent, &["chat", "explain_concept", "answer_question"]);
    tagged(agent, &["ai", "students"])
}

fn analytics_agent(host: &str) -> Agent {
    let agent = Agent::new("analytics", "Learning Analytics", AgentType::Analytics)
        .with_address(format!("{host}:8102"));
    let agent = with_capabilities(
        agent,
        &["grade_prediction", "performance_analysis", "report"],
    );
    tagged(agent, &["ai", "grades"])
}

fn content_agent(host: &str) -> Agent {
    let agent = Agent::new("content", "Content Generator", AgentType::ContentGeneration)
        .with_address(format!("{host}:8103"));
    let agent = with_capabilities(agent, &["quiz_generation", "summary", "lesson_outline"]);
    tagged(agent, &["ai", "courses"])
}

fn recommendation_agent(host: &str) -> Agent {
    let agent = Agent::new(
        "recommendation",
        "Resource Recommender",
        AgentType::Recommendation,
    )
    .with_address(format!("{host}:8104"));
    let agent = with_capabilities(agent, &["resource_recommendation", "learning_path"]);
    tagged(agent, &["ai", "resources"])
}
