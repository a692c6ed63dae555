mod dispatch;
mod maintenance;
mod promise;
