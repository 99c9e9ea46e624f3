//! Strategies for choosing one alias out of several.

use std::cell::RefCell;
use std::io::{self, BufRead, BufReader, Stdin, Stdout, Write};

use super::DiscoveryError;

/// Picks one alias out of those discovery found.
pub trait AliasSelector {
    /// Chooses an alias from `aliases`, which is never empty. Interactive
    /// selectors are only consulted when it holds at least two entries.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::SelectionCancelled`] when the operator backs
    /// out, or another [`DiscoveryError`] when no valid choice can be made.
    fn select(&self, aliases: &[String]) -> Result<String, DiscoveryError>;

    /// Returns `true` when the operator named an alias up front, which must
    /// then be validated even if only one alias is declared.
    fn is_explicit(&self) -> bool {
        false
    }
}

/// Asks the operator on a console to pick a numbered alias.
///
/// Invalid input re-prompts. End of input or `q` cancels the selection.
#[derive(Debug)]
pub struct PromptSelector<R, W> {
    input: RefCell<R>,
    output: RefCell<W>,
}

impl PromptSelector<BufReader<Stdin>, Stdout> {
    /// Prompts on the process's standard input and output.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R: BufRead, W: Write> PromptSelector<R, W> {
    /// Builds a selector over arbitrary reader and writer handles.
    pub const fn new(input: R, output: W) -> Self {
        Self {
            input: RefCell::new(input),
            output: RefCell::new(output),
        }
    }

    /// Returns the writer, which tests use to inspect the rendered prompt.
    pub fn into_output(self) -> W {
        self.output.into_inner()
    }

    fn prompt_error(err: &io::Error) -> DiscoveryError {
        DiscoveryError::Prompt {
            message: err.to_string(),
        }
    }
}

impl<R: BufRead, W: Write> AliasSelector for PromptSelector<R, W> {
    fn select(&self, aliases: &[String]) -> Result<String, DiscoveryError> {
        let mut input = self.input.borrow_mut();
        let mut output = self.output.borrow_mut();

        writeln!(output, "Available SSH hosts:").map_err(|err| Self::prompt_error(&err))?;
        for (position, alias) in aliases.iter().enumerate() {
            writeln!(output, "{}. {alias}", position + 1)
                .map_err(|err| Self::prompt_error(&err))?;
        }

        loop {
            write!(output, "Select host number: ").map_err(|err| Self::prompt_error(&err))?;
            output.flush().map_err(|err| Self::prompt_error(&err))?;

            let mut line = String::new();
            let read = input
                .read_line(&mut line)
                .map_err(|err| Self::prompt_error(&err))?;
            let answer = line.trim();
            if read == 0 || answer.eq_ignore_ascii_case("q") {
                writeln!(output, "\nHost selection cancelled.").ok();
                return Err(DiscoveryError::SelectionCancelled);
            }

            match answer.parse::<usize>() {
                Ok(choice) => {
                    if let Some(alias) = choice.checked_sub(1).and_then(|index| aliases.get(index))
                    {
                        return Ok(alias.clone());
                    }
                    writeln!(
                        output,
                        "Invalid choice. Please enter a number between 1 and {}.",
                        aliases.len()
                    )
                    .map_err(|err| Self::prompt_error(&err))?;
                }
                Err(_) => {
                    writeln!(output, "Please enter a valid number.")
                        .map_err(|err| Self::prompt_error(&err))?;
                }
            }
        }
    }
}

/// Returns an alias chosen up front, for non-interactive callers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FixedSelector {
    alias: String,
}

impl FixedSelector {
    /// Wraps the pre-chosen alias.
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
        }
    }
}

impl AliasSelector for FixedSelector {
    fn select(&self, aliases: &[String]) -> Result<String, DiscoveryError> {
        if aliases.iter().any(|alias| *alias == self.alias) {
            return Ok(self.alias.clone());
        }
        Err(DiscoveryError::UnknownAlias {
            alias: self.alias.clone(),
            available: aliases.join(", "),
        })
    }

    fn is_explicit(&self) -> bool {
        true
    }
}

/// Selector chosen at runtime: a fixed alias when one was supplied, the
/// console prompt otherwise.
#[derive(Debug)]
pub enum SelectorChoice {
    /// Use the supplied alias.
    Fixed(FixedSelector),
    /// Ask on the console.
    Prompt(PromptSelector<BufReader<Stdin>, Stdout>),
}

impl SelectorChoice {
    /// Picks [`FixedSelector`] when `alias` is set, else the stdio prompt.
    #[must_use]
    pub fn from_option(alias: Option<String>) -> Self {
        alias.map_or_else(
            || Self::Prompt(PromptSelector::stdio()),
            |value| Self::Fixed(FixedSelector::new(value)),
        )
    }
}

impl AliasSelector for SelectorChoice {
    fn select(&self, aliases: &[String]) -> Result<String, DiscoveryError> {
        match self {
            Self::Fixed(selector) => selector.select(aliases),
            Self::Prompt(selector) => selector.select(aliases),
        }
    }

    fn is_explicit(&self) -> bool {
        matches!(self, Self::Fixed(_))
    }
}
