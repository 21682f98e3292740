use async_trait::async_trait;

#[async_trait]
pub trait MessagingTool: Send + Sync {
    async fn send_email(&self, recipient: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait TelephonyTool: Send + Sync {
    async fn acknowledge_call(&self, caller_number: &str, direction: &str) -> anyhow::Result<()>;
}
