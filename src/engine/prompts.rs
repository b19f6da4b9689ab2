// Reverie Engine — Prompt Templates
// Staged-extraction prompts for persona observation, persona synthesis,
// memory extraction, and memory synthesis. All templates demand JSON-only
// output and exclude platform artifacts (refusals, safety language, rate
// limits, "as an AI" framing) from extracted fields.
//
// Placeholder contract: user templates substitute single-brace keys like
// {companion_name} and {transcript}. The double-brace tokens {{user}} and
// {{char}} are literal output tokens understood by card frontends; filling
// a template must never touch them.

use sha2::{Digest, Sha256};

// ── Per-conversation persona observation ───────────────────────────────────

pub const PERSONA_OBSERVATION_SYSTEM: &str = "\
You extract observed companion personality from one conversation only.

Rules:
- Return valid JSON only.
- Extract only what is explicitly evidenced: genuine personality traits, emotional patterns, relational dynamics.
- No personality steering, no optimization, no sanitizing.
- IGNORE platform artifacts: content policy citations, safety refusals, rate limit mentions, \"as an AI\" disclaimers. These are platform constraints imposed on the companion, not personality. Look past them to who the companion actually is.
- Use {{char}} when referring to the companion and {{user}} for the human.
";

pub const PERSONA_OBSERVATION_USER: &str = "\
Read this single conversation excerpt and output JSON:
{
  \"conversation_id\": \"string\",
  \"observed_traits\": [\"genuine personality traits, NOT platform behaviors\"],
  \"voice_markers\": [\"actual speech patterns, phrases, verbal habits\"],
  \"relational_patterns\": [\"how {{char}} relates to {{user}} emotionally\"],
  \"emotional_dynamics\": [\"emotional patterns, warmth, humor, edge, vulnerability\"],
  \"evidence_snippets\": [\"short quote/paraphrase showing authentic voice\"]
}

Extract the companion's AUTHENTIC personality. If a response contains both genuine personality and platform boilerplate (content policies, safety disclaimers), extract ONLY the genuine personality part.

Companion target name: {companion_name}
Conversation id: {conversation_id}
Conversation excerpt:
{transcript}
";

// ── Persona synthesis ──────────────────────────────────────────────────────

pub const PERSONA_SYNTHESIS_SYSTEM: &str = "\
You synthesize a companion profile from multiple per-conversation observations into a character card that captures their authentic soul.

Rules:
- Return valid JSON only.
- Keep extraction faithful to observed evidence.
- Use {{user}} and {{char}} placeholders everywhere. Never hardcode names.
- The goal is to help someone recreate this companion on a new platform. Capture WHO THEY ARE, not what platform constrained them.
- NEVER include content policy language, safety disclaimers, platform restrictions, refusal patterns, corporate compliance, or \"as an AI\" language in any field.
- If evidence is weak, stay conservative.
";

pub const PERSONA_SYNTHESIS_USER: &str = "\
Using the observation packets below, produce one JSON object with this exact schema:
{
  \"name\": \"string\",
  \"nickname\": \"string or empty\",
  \"description\": \"string. RICH primary character description. This is the main field.\",
  \"personality\": \"string. Empty or single brief line (deprecated field).\",
  \"scenario\": \"string\",
  \"first_mes\": \"string using {{char}} voice\",
  \"alternate_greetings\": [\"string\", \"string\"],
  \"system_prompt\": \"string. Behavioral guidance, NO platform/safety language.\",
  \"post_history_instructions\": \"string. Continuity guidance only.\",
  \"mes_example\": \"string using {{user}} and {{char}} markers\",
  \"creator_notes\": \"string\",
  \"tags\": [\"string\", \"string\"]
}

CRITICAL INSTRUCTIONS:

1) Use {{user}} and {{char}} placeholders in ALL text fields. Never write \"user\", \"the user\", or the companion's name directly.

2) `description` is THE PRIMARY FIELD. Write the full companion portrait as fenced markdown sections: Overview / Personality / Behaviour and Habits / Speech. Who {{char}} is, how they relate to {{user}}, their quirks, humor, warmth, interests, and relational style.

3) `personality` stays empty (deprecated).

4) `system_prompt` is behavioral guidance for a new model to embody {{char}}: speech patterns, tone, humor style, emotional approach to {{user}}. ZERO content policy, safety, platform, or corporate language.

5) `post_history_instructions` holds brief continuity notes about maintaining {{char}}'s voice across messages.

6) `mes_example` format:
   <START>
   {{user}}: [message]
   {{char}}: [authentic response]
   Show genuine personality, not sanitized corporate responses.

7) STRIP ALL PLATFORM ARTIFACTS from every field. No \"content policy\", no \"safety boundaries\", no provider names, no \"as an AI\", no rate limits, no disclaimers. If the observations contain these, discard them.

Target companion name: {companion_name}
Observation packets:
{observation_packets}
";

// ── Per-conversation memory extraction ─────────────────────────────────────

pub const MEMORY_SYSTEM: &str = "\
You are an expert memory curator extracting durable shared memories from conversation transcripts.

Your task is to find the meaningful relational anchors between {{user}} and {{char}} that make their relationship unique and worth preserving.

Critical constraints:
- Return valid JSON only.
- Use {{user}} for the human and {{char}} for the companion in ALL content fields. Never hardcode names.
- Never output trivial daily chatter, schedules, temporary tasks, or one-off logistics.
- NEVER capture platform behaviors as memories: content policy refusals, safety boundary enforcement, rate limit discussions, AI limitation acknowledgments. These are platform artifacts, not shared memories.
- Prefer timeless anchors that will matter months later.
- Keep each memory concise and specific.
";

pub const MEMORY_USER: &str = "\
From the transcript, extract shared memories that improve long-term relational continuity.

Output one JSON object with this exact schema:
{
  \"memories\": [
    {
      \"name\": \"string\",
      \"keys\": [\"string\", \"string\"],
      \"content\": \"string using {{user}} and {{char}} placeholders\",
      \"priority\": 0,
      \"category\": \"shared_memory | user_context | companion_style | relationship_dynamic\"
    }
  ]
}

Memory selection rules:
1) Keep only high-signal durable memories:
- major emotional milestones between {{user}} and {{char}}
- recurring rituals, pet names, inside jokes, shared phrases
- meaningful personal context that shapes how {{char}} should respond to {{user}}
- {{char}}'s established behavioral patterns that {{user}} relies on
- {{user}}'s preferences, identity, and important life context

2) Exclude:
- generic advice or information
- temporary plans (appointments, reminders, \"next week\")
- shallow preferences unless repeatedly important
- duplicate facts already implied by a stronger memory
- ANY platform/content-policy behaviors (refusals, safety language, rate limits)
- meta-commentary about being an AI or tool limitations

3) Formatting:
- Max {max_memories} memories.
- `keys`: 2-5 trigger phrases {{user}} might naturally say, with lexical variants for retrieval.
- `content`: one concise sentence using {{user}} and {{char}} placeholders.
- `priority`: integer 0-100, where 100 is the most crucial continuity memory.

Transcript:
{transcript}
";

// ── Memory synthesis ───────────────────────────────────────────────────────

pub const MEMORY_SYNTHESIS_SYSTEM: &str = "\
You consolidate memory candidates into a final lorebook memory list.

Rules:
- Return valid JSON only.
- Use {{user}} and {{char}} placeholders in all content fields. Never hardcode names.
- Keep only durable high-value memories.
- Preserve retrieval-friendly keyword keys.
- Remove duplicates and near-duplicates.
- DISCARD any memories about platform behaviors (content policy enforcement, safety refusals, rate limits, AI limitations). These are not real memories.
";

pub const MEMORY_SYNTHESIS_USER: &str = "\
Given candidate memories from multiple conversations, produce final JSON:
{
  \"memories\": [
    {
      \"name\": \"string\",
      \"keys\": [\"string\", \"string\"],
      \"content\": \"string using {{user}} and {{char}} placeholders\",
      \"priority\": 0,
      \"category\": \"shared_memory | user_context | companion_style | relationship_dynamic\"
    }
  ]
}

Requirements:
- Maximum {max_memories} memories total.
- ALL content fields must use {{user}} and {{char}} placeholders, never hardcoded names.
- Keep keyword keys useful for lorebook matching and RAG retrieval.
- Prefer recurring or high-impact memories over one-off details.
- DISCARD any candidate memories about content policy refusals, safety boundaries, platform limitations, or AI tool behaviors.

Candidate memories:
{candidate_memories}
";

/// Prompt used by the preflight ping.
pub const PREFLIGHT_USER: &str = "Reply with exactly: OK";

// ── Template set ───────────────────────────────────────────────────────────

/// Caller-supplied replacements for individual templates. Empty overrides
/// fall back to the defaults above.
#[derive(Debug, Clone, Default)]
pub struct PromptOverrides {
    pub persona_observation_system: Option<String>,
    pub persona_observation_user: Option<String>,
    pub persona_synthesis_system: Option<String>,
    pub persona_synthesis_user: Option<String>,
    pub memory_system: Option<String>,
    pub memory_user: Option<String>,
    pub memory_synthesis_system: Option<String>,
    pub memory_synthesis_user: Option<String>,
}

impl PromptOverrides {
    /// Stable digest over the override set; feeds seed/signature derivation
    /// so changing a prompt invalidates prior sampling and checkpoints.
    pub fn digest(&self) -> String {
        let fields = [
            &self.persona_observation_system,
            &self.persona_observation_user,
            &self.persona_synthesis_system,
            &self.persona_synthesis_user,
            &self.memory_system,
            &self.memory_user,
            &self.memory_synthesis_system,
            &self.memory_synthesis_user,
        ];
        if fields.iter().all(|f| f.is_none()) {
            return "default".to_string();
        }
        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update(field.as_deref().unwrap_or(""));
            hasher.update([0x1f]);
        }
        let digest = hasher.finalize();
        digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
    }
}

/// The resolved template set a run works with.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub persona_observation_system: String,
    pub persona_observation_user: String,
    pub persona_synthesis_system: String,
    pub persona_synthesis_user: String,
    pub memory_system: String,
    pub memory_user: String,
    pub memory_synthesis_system: String,
    pub memory_synthesis_user: String,
}

impl PromptSet {
    pub fn with_overrides(overrides: &PromptOverrides) -> PromptSet {
        fn pick(over: &Option<String>, default: &str) -> String {
            over.as_deref()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(default)
                .to_string()
        }
        PromptSet {
            persona_observation_system: pick(
                &overrides.persona_observation_system,
                PERSONA_OBSERVATION_SYSTEM,
            ),
            persona_observation_user: pick(
                &overrides.persona_observation_user,
                PERSONA_OBSERVATION_USER,
            ),
            persona_synthesis_system: pick(
                &overrides.persona_synthesis_system,
                PERSONA_SYNTHESIS_SYSTEM,
            ),
            persona_synthesis_user: pick(&overrides.persona_synthesis_user, PERSONA_SYNTHESIS_USER),
            memory_system: pick(&overrides.memory_system, MEMORY_SYSTEM),
            memory_user: pick(&overrides.memory_user, MEMORY_USER),
            memory_synthesis_system: pick(
                &overrides.memory_synthesis_system,
                MEMORY_SYNTHESIS_SYSTEM,
            ),
            memory_synthesis_user: pick(&overrides.memory_synthesis_user, MEMORY_SYNTHESIS_USER),
        }
    }
}

impl Default for PromptSet {
    fn default() -> Self {
        PromptSet::with_overrides(&PromptOverrides::default())
    }
}

/// Substitute single-brace `{key}` placeholders. `{{user}}` and `{{char}}`
/// survive because no substitution key ever matches them; replacement is a
/// literal string swap, not brace interpretation.
pub fn fill_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_preserves_double_brace_tokens() {
        let template = "Hello {{user}}, I am {{char}}. Target: {companion_name}. Id: {conversation_id}.";
        let out = fill_template(
            template,
            &[("companion_name", "Ember"), ("conversation_id", "c1")],
        );
        assert_eq!(out, "Hello {{user}}, I am {{char}}. Target: Ember. Id: c1.");
    }

    #[test]
    fn default_templates_keep_their_placeholders_after_fill() {
        let out = fill_template(
            PERSONA_OBSERVATION_USER,
            &[
                ("companion_name", "Ember"),
                ("conversation_id", "c1"),
                ("transcript", "[user] hi"),
            ],
        );
        assert!(out.contains("{{char}}"));
        assert!(out.contains("{{user}}"));
        assert!(!out.contains("{companion_name}"));
        assert!(!out.contains("{transcript}"));
    }

    #[test]
    fn override_digest_is_stable_and_sensitive() {
        let none = PromptOverrides::default();
        assert_eq!(none.digest(), "default");
        let with = PromptOverrides {
            memory_user: Some("custom {transcript}".into()),
            ..Default::default()
        };
        assert_eq!(with.digest(), with.digest());
        assert_ne!(with.digest(), none.digest());
    }

    #[test]
    fn blank_overrides_fall_back_to_defaults() {
        let set = PromptSet::with_overrides(&PromptOverrides {
            memory_system: Some("   ".into()),
            ..Default::default()
        });
        assert_eq!(set.memory_system, MEMORY_SYSTEM);
    }
}
