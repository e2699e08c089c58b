use minijinja::{context, Environment};

const AUTO_REPLY_TEMPLATE: &str = include_str!("prompts/auto_reply.j2");
const DEFAULT_BOT_NAME: &str = "Support Bot";

pub struct AutoReplyPromptContext<'a> {
    pub bot_name: &'a str,
    pub channel_name: &'a str,
    pub channel_type: &'a str,
    pub instructions: &'a str,
}

impl AutoReplyPromptContext<'_> {
    fn bot_name(&self) -> &str {
        let name = self.bot_name.trim();
        if name.is_empty() {
            DEFAULT_BOT_NAME
        } else {
            name
        }
    }
}

pub fn render_auto_reply_prompt(ctx: &AutoReplyPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env.add_template("auto_reply", AUTO_REPLY_TEMPLATE).is_err() {
        return fallback_auto_reply_prompt(ctx);
    }

    let Ok(template) = env.get_template("auto_reply") else {
        return fallback_auto_reply_prompt(ctx);
    };

    template
        .render(context! {
            bot_name => ctx.bot_name(),
            channel_name => ctx.channel_name.trim(),
            channel_type => ctx.channel_type,
            instructions => ctx.instructions.trim(),
        })
        .map(|prompt| prompt.trim().to_string())
        .unwrap_or_else(|_| fallback_auto_reply_prompt(ctx))
}

fn fallback_auto_reply_prompt(ctx: &AutoReplyPromptContext<'_>) -> String {
    let mut prompt = format!(
        "You are {} answering {} messages for \"{}\".\n\
         Be accurate, concise and practical. Never invent facts.\n\
         If the customer asks for a person, say a human agent will follow up.\n",
        ctx.bot_name(),
        ctx.channel_type,
        ctx.channel_name.trim(),
    );

    if !ctx.instructions.trim().is_empty() {
        prompt.push_str("\nBusiness instructions:\n");
        prompt.push_str(ctx.instructions.trim());
        prompt.push('\n');
    }

    prompt
}
