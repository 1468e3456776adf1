use redis::Pipeline;

/// Records a sequence of `(command, args)` tuples for atomic replay on a
/// single pooled connection inside MULTI/EXEC. This is the typed surface
/// behind the pool's one-connection-per-pipeline guarantee.
#[derive(Debug, Default, Clone)]
pub struct KvTransaction {
    commands: Vec<(String, Vec<String>)>,
}

impl KvTransaction {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    /// Record one command. Arguments are captured as strings; integers go
    /// through `to_string()` at the call site.
    pub fn command<S: Into<String>>(
        mut self,
        name: &str,
        args: impl IntoIterator<Item = S>,
    ) -> Self {
        self.commands.push((
            name.to_ascii_uppercase(),
            args.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn commands(&self) -> &[(String, Vec<String>)] {
        &self.commands
    }

    /// Replayable MULTI/EXEC pipeline, in recorded order.
    pub(crate) fn into_pipeline(self) -> Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (name, args) in &self.commands {
            pipe.cmd(name);
            for arg in args {
                pipe.arg(arg);
            }
        }
        pipe
    }
}
