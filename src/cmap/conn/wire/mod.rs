mod header;
mod message;
#[cfg(test)]
mod test;
mod util;

pub(crate) use self::{
    message::{Message, MessageFlags, MessageSection},
    util::next_request_id,
};
