pub mod policy;
pub mod server;

#[derive(Debug)]
pub enum Action {
    Server(server::Args),
    Policy(policy::Args),
}

impl Action {
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<()> {
        match self {
            Self::Server(args) => server::execute(args).await,
            Self::Policy(args) => {
                policy::execute(&args);
                Ok(())
            }
        }
    }
}
