use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "ssr")] {
        use anyhow::Context;
        use dotenv::dotenv;
        use env_logger::Env;
        use productive_me::client::{CopilotClient, TurnOutcome, TurnStatus};
        use productive_me::config::ClientConfig;
        use productive_me::frame::ProposedAction;
        use std::env;
        use std::io::{self, BufRead, Write};

        /// Prints the part of `draft` not shown yet, or the whole draft again
        /// when it no longer extends what is on screen.
        fn render_draft(shown: &mut String, draft: &str) {
            let mut stdout = io::stdout();
            if let Some(suffix) = draft.strip_prefix(shown.as_str()) {
                let _ = write!(stdout, "{suffix}");
            } else {
                let _ = write!(stdout, "\n{draft}");
            }
            let _ = stdout.flush();
            *shown = draft.to_string();
        }

        fn report(outcome: &TurnOutcome) {
            match &outcome.status {
                TurnStatus::Completed => println!(),
                TurnStatus::Incomplete => println!("\n[reply incomplete: connection closed early]"),
                TurnStatus::Errored(reason) => println!("\n[reply failed: {reason}]"),
                TurnStatus::Cancelled => println!("\n[cancelled]"),
            }
            for (index, proposed) in outcome.proposed_actions.iter().enumerate() {
                println!("  /do {} -> {} {}", index + 1, proposed.action, proposed.input);
            }
            for warning in &outcome.warnings {
                println!("  warning: {warning}");
            }
        }

        async fn ask(client: &CopilotClient, prompt: &str) -> anyhow::Result<TurnOutcome> {
            let mut shown = String::new();
            let outcome = client
                .send_prompt_with(prompt, |view| {
                    if let Some(reply) = view.current_reply() {
                        if reply.content() != shown {
                            render_draft(&mut shown, reply.content());
                        }
                    }
                })
                .await?;
            report(&outcome);
            Ok(outcome)
        }

        async fn confirm(client: &CopilotClient, proposed: &[ProposedAction], choice: &str) -> anyhow::Result<()> {
            let index: usize = choice.trim().parse().context("usage: /do <number>")?;
            let action = index
                .checked_sub(1)
                .and_then(|i| proposed.get(i))
                .context("no such proposed action")?;
            let result = client.execute_action(action).await?;
            println!("{result}");
            Ok(())
        }

        #[tokio::main]
        async fn main() -> anyhow::Result<()> {
            dotenv().ok();
            env_logger::init_from_env(Env::default().default_filter_or("info"));

            let config = ClientConfig::from_env().context("failed to load client configuration")?;
            let client = CopilotClient::from_config(config);

            let args: Vec<String> = env::args().skip(1).collect();
            if !args.is_empty() {
                let outcome = ask(&client, &args.join(" ")).await?;
                if !outcome.is_complete() {
                    std::process::exit(1);
                }
                return Ok(());
            }

            println!("Type a prompt, /do <n> to run a proposed action, or /quit.");
            let mut proposed: Vec<ProposedAction> = Vec::new();
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                if let Some(choice) = line.strip_prefix("/do ") {
                    if let Err(e) = confirm(&client, &proposed, choice).await {
                        println!("  {e}");
                    }
                    continue;
                }

                match ask(&client, line).await {
                    Ok(outcome) => proposed = outcome.proposed_actions,
                    Err(e) => println!("  {e}"),
                }
            }
            Ok(())
        }
    } else {
        fn main() {}
    }
}
