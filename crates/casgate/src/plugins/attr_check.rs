use std::sync::Arc;

use anyhow::Context;

use crate::plugins::{AccessControl, PluginFactory, PluginHandle};
use crate::session::Attributes;

pub static FACTORY: PluginFactory = PluginFactory {
	tag: "attr-check",
	usage: "attr-check:NAME=VALUE",
	build,
};

fn build(args: &str) -> anyhow::Result<PluginHandle> {
	let (name, value) = args
		.split_once('=')
		.context("attr-check requires NAME=VALUE")?;
	if name.is_empty() || value.is_empty() {
		anyhow::bail!("attr-check requires NAME=VALUE");
	}
	Ok(PluginHandle {
		access_control: Some(Arc::new(AttrCheck {
			name: name.to_string(),
			value: value.to_string(),
		})),
		..Default::default()
	})
}

/// Denies any user whose released attributes do not carry a required value.
struct AttrCheck {
	name: String,
	value: String,
}

impl AccessControl for AttrCheck {
	fn tag(&self) -> &'static str {
		"attr-check"
	}

	fn is_allowed(&self, _username: &str, attributes: &Attributes) -> Result<(), String> {
		let present = attributes
			.get(&self.name)
			.is_some_and(|values| values.iter().any(|v| v == &self.value));
		if present {
			Ok(())
		} else {
			Err(format!(
				"attribute '{}' does not include '{}'",
				self.name, self.value
			))
		}
	}
}
