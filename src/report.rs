use crate::directive::Directive;
use crate::model::{FormData, Group};

const RULE_LINE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

pub fn format_groups(groups: &[Group], detailed: bool) -> String {
    let mut output = String::new();

    output.push_str("\n📂 Redirect Groups\n");
    output.push_str(RULE_LINE);
    output.push_str("\n\n");

    if groups.is_empty() {
        output.push_str("  No groups created\n\n");
        return output;
    }

    for group in groups {
        let marker = if group.enabled { "✅" } else { "⏸️ " };
        output.push_str(&format!(
            "{} {} ({} rules)\n",
            marker,
            group.name,
            group.rules.len()
        ));
        if detailed {
            output.push_str(&format!("    Group ID: {}\n", group.id));
        }

        for rule in &group.rules {
            let state = if group.enabled && rule.enabled { "on " } else { "off" };
            output.push_str(&format!(
                "  • [{}] {} → {}\n",
                state, rule.pattern, rule.redirect
            ));
            if detailed {
                output.push_str(&format!("      Rule ID: {}\n", rule.id));
            }
        }
        output.push('\n');
    }

    output.push_str(RULE_LINE);
    output.push('\n');

    let active: usize = groups.iter().map(|g| g.active_rules().count()).sum();
    let total: usize = groups.iter().map(|g| g.rules.len()).sum();
    output.push_str(&format!(
        "\n📊 Summary: {} groups, {}/{} rules active\n\n",
        groups.len(),
        active,
        total
    ));

    output
}

pub fn format_directives(directives: &[Directive]) -> String {
    let mut output = String::new();

    output.push_str("\n🔀 Installed Redirect Directives\n");
    output.push_str(RULE_LINE);
    output.push_str("\n\n");

    if directives.is_empty() {
        output.push_str("  No active directives\n\n");
        return output;
    }

    for directive in directives {
        output.push_str(&format!(
            "  #{:<4} {} → {}\n",
            directive.id,
            directive.condition.regex_filter,
            directive.target_url()
        ));
    }
    output.push('\n');
    output
}

pub fn format_draft(form: &FormData) -> String {
    let group = if form.group_id.is_empty() {
        "(none)"
    } else {
        form.group_id.as_str()
    };
    format!(
        "📝 Draft\n  Group:    {}\n  Pattern:  {}\n  Redirect: {}\n  Enabled:  {}\n",
        group, form.pattern, form.redirect, form.enabled
    )
}
