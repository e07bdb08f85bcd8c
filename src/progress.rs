use indicatif::{ProgressBar as Bar, ProgressStyle};

/// Progress reporting for the two long-running passes.
pub enum ProgressBar {
	Map,
	Decrypt,
}

impl ProgressBar {
	/// Create a bar for `total` units and hand back its increment closure.
	pub fn new(self, total: u64) -> impl Fn(u64) + Send + Sync {
		let bar = Bar::new(total);
		bar.set_style(
			ProgressStyle::with_template("{msg:8} [{bar:40}] {pos}/{len}")
				.unwrap_or_else(|_| ProgressStyle::default_bar())
				.progress_chars("=> "),
		);
		bar.set_message(match self {
			ProgressBar::Map => "map",
			ProgressBar::Decrypt => "decrypt",
		});

		move |delta| {
			bar.inc(delta);
			if Some(bar.position()) == bar.length() {
				bar.finish_and_clear();
			}
		}
	}
}
